#![cfg(test)]

// Property tests for Store kept inside the crate so they can drive the
// table directly and check its structural invariants after every step.

use crate::store::testing::{fresh_key, get_or_init, hash_for_bucket, key_with_hash, peek, Owned};
use crate::store::Store;
use proptest::prelude::*;
use std::collections::HashMap;

// Pool-indexed operations to improve shrinking: indices shrink to earlier
// handles, op lists shrink in length.
#[derive(Clone, Debug)]
enum Op {
    Set(usize, i32),
    Get(usize, i32),
    Remove(usize),
    // Drop the handle and replace it in the pool with a fresh one.
    DropHandle(usize),
    Fork,
}

fn arb_ops(pool: usize) -> impl Strategy<Value = Vec<Op>> {
    let idx = 0..pool;
    let op = prop_oneof![
        4 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Set(i, v)),
        3 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Get(i, v)),
        3 => idx.clone().prop_map(Op::Remove),
        1 => idx.prop_map(Op::DropHandle),
        1 => Just(Op::Fork),
    ];
    proptest::collection::vec(op, 1..200)
}

fn run(pool: usize, ops: Vec<Op>, mut make_key: impl FnMut() -> Owned) -> Result<(), TestCaseError> {
    let mut sut: Store<i32> = Store::new();
    let mut model: HashMap<usize, i32> = HashMap::new();
    let mut keys: Vec<Owned> = (0..pool).map(|_| make_key()).collect();
    // Dropped handles whose pairs may still be unswept.
    let mut graveyard: Vec<Owned> = Vec::new();
    let mut max_capacity = sut.stats().capacity;

    for op in ops {
        match op {
            Op::Set(i, v) => {
                sut.put(keys[i].key.clone(), v);
                model.insert(i, v);
            }
            Op::Get(i, init) => {
                let got = get_or_init(&mut sut, &keys[i].key, init);
                let expected = *model.entry(i).or_insert(init);
                prop_assert_eq!(got, expected);
            }
            Op::Remove(i) => {
                let removed = sut.remove(&keys[i].key);
                prop_assert_eq!(removed, model.remove(&i).is_some());
            }
            Op::DropHandle(i) => {
                let mut old = std::mem::replace(&mut keys[i], make_key());
                old.clear();
                graveyard.push(old);
                model.remove(&i);
            }
            Op::Fork => {
                let child = sut.fork();
                child.assert_invariants();
                prop_assert_eq!(child.stats().size, sut.stats().size);
                prop_assert_eq!(child.stats().tombstones, sut.stats().tombstones);
                for (i, k) in keys.iter().enumerate() {
                    prop_assert_eq!(peek(&child, &k.key), model.get(&i).copied());
                }
            }
        }
        let _ = sut.take_evicted();

        // Post-conditions after each op
        sut.assert_invariants();
        for (i, k) in keys.iter().enumerate() {
            prop_assert_eq!(peek(&sut, &k.key), model.get(&i).copied());
        }
        let stats = sut.stats();
        prop_assert!(stats.size >= model.len());
        prop_assert!(stats.size <= model.len() + graveyard.len());
        prop_assert!(stats.capacity >= max_capacity, "capacity shrank");
        max_capacity = stats.capacity;
    }
    Ok(())
}

// Property: state-machine equivalence against std::collections::HashMap.
// Invariants exercised across random operation sequences:
// - set/get/remove agree with the model, lazy get installs exactly once.
// - Structural invariants hold after every op (load bound, reachability,
//   no duplicate keys, counters in sync).
// - Dropped handles never make live values disappear.
// - Forks reproduce every live value and the parent's counters.
// - Capacity is monotonic.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in (1usize..=24).prop_flat_map(|p| (Just(p), arb_ops(p)))) {
        run(pool, ops, fresh_key)?;
    }
}

// Same state machine under heavy collisions: every handle hashes to bucket 0
// of a 16-pair table, and to bucket 0 or 16 once the table grows.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine_with_collisions((pool, ops) in (1usize..=12).prop_flat_map(|p| (Just(p), arb_ops(p)))) {
        let mut n = 0u32;
        let base = hash_for_bucket(0);
        run(pool, ops, move || {
            n += 1;
            key_with_hash(base + 32 * n)
        })?;
    }
}

// Churn: insert N handles, remove a random half, the rest keep their values
// whatever rehashes happened in between.
proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]
    #[test]
    fn prop_churn_round_trip(removed in proptest::collection::vec(any::<bool>(), 1..120)) {
        let mut sut: Store<i32> = Store::new();
        let keys: Vec<Owned> = removed.iter().map(|_| fresh_key()).collect();
        for (i, k) in keys.iter().enumerate() {
            sut.put(k.key.clone(), i as i32);
        }
        for (k, gone) in keys.iter().zip(&removed) {
            if *gone {
                prop_assert!(sut.remove(&k.key));
            }
        }
        for (i, (k, gone)) in keys.iter().zip(&removed).enumerate() {
            let expected = if *gone { None } else { Some(i as i32) };
            prop_assert_eq!(peek(&sut, &k.key), expected);
        }
        sut.assert_invariants();
    }
}
