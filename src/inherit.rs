//! Inheritance of thread-local values into child threads.
//!
//! A fork happens in two phases on the parent thread. Under the store
//! borrow, the inheritable store is copied slot for slot (cleared keys are
//! buried in both copies), sharing the parent's values. With the borrow
//! released, each live value is replaced by its handle's transform, which is
//! user code. The result is a `Send` snapshot that the child installs as its
//! own inheritable store before running anything else.

use crate::error::{AccessError, InitError, SpawnError};
use crate::handle::{with_values, StoreKind, ThreadStore};
use crate::store::{SlotKey, Store};
use core::convert::Infallible;
use core::fmt;
use std::any::Any;
use std::rc::Rc;
use std::thread::{self, JoinHandle};

type InheritedStore = Store<Box<dyn Any + Send>>;

/// Inheritable thread-local values captured from a parent thread.
pub struct Inherited {
    store: Option<InheritedStore>,
}

impl Inherited {
    /// Snapshot the calling thread's inheritable values, transformed for a
    /// child thread.
    pub fn capture() -> Result<Self, AccessError> {
        let skeleton = with_values(|values| values.store(StoreKind::Inheritable).as_mut().map(Store::fork))?;
        let Some(skeleton) = skeleton else {
            return Ok(Self { store: None });
        };

        let buried = skeleton.stats().tombstones;
        let store = skeleton.try_map(child_value)?;
        tracing::debug!(
            inherited = store.len(),
            tombstones = buried,
            "captured inheritable thread-local values"
        );
        Ok(Self { store: Some(store) })
    }

    /// Number of values carried over.
    pub fn len(&self) -> usize {
        self.store.as_ref().map_or(0, Store::len)
    }

    /// Whether no values were carried over.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the captured values the calling thread's inheritable values,
    /// replacing any it already had.
    pub fn install(self) -> Result<(), AccessError> {
        let store: Option<ThreadStore> = self.store.map(into_thread_store);
        let previous = with_values(|values| core::mem::replace(values.store(StoreKind::Inheritable), store))?;
        drop(previous);
        Ok(())
    }
}

impl fmt::Debug for Inherited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inherited").field("len", &self.len()).finish()
    }
}

fn child_value(key: &SlotKey, parent: Rc<dyn Any>) -> Result<Option<Box<dyn Any + Send>>, InitError> {
    match key.upgrade() {
        Some(handle) => handle.child_value(&*parent).map(Some),
        // Dropped since the copy was taken.
        None => Ok(None),
    }
}

fn into_thread_store(store: InheritedStore) -> ThreadStore {
    let mapped = store.try_map(|_, value| {
        let value: Rc<dyn Any + Send> = Rc::from(value);
        Ok::<_, Infallible>(Some(value as Rc<dyn Any>))
    });
    match mapped {
        Ok(store) => store,
        Err(never) => match never {},
    }
}

/// Spawn a thread that starts with the caller's inheritable thread-local
/// values.
///
/// # Panics
///
/// Like [`std::thread::spawn`], if the thread cannot be created, and if an
/// inheritance transform fails.
pub fn spawn<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match spawn_with(thread::Builder::new(), f) {
        Ok(handle) => handle,
        Err(e) => panic!("failed to spawn thread: {e}"),
    }
}

/// Spawn a thread from `builder`, inheriting the caller's inheritable
/// thread-local values.
pub fn spawn_with<F, R>(builder: thread::Builder, f: F) -> Result<JoinHandle<R>, SpawnError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let inherited = Inherited::capture()?;
    let handle = builder.spawn(move || {
        if let Err(e) = inherited.install() {
            // A fresh thread cannot be tearing down its storage.
            unreachable!("child thread rejected inherited values: {e}");
        }
        f()
    })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Builder, ThreadLocal};
    use crate::hash::KeyHash;
    use std::sync::Arc;

    fn on_fresh_thread<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> R {
        thread::spawn(f).join().unwrap()
    }

    /// Invariant: without inheritable values the snapshot is empty.
    #[test]
    fn capture_without_store_is_empty() {
        on_fresh_thread(|| {
            let plain: ThreadLocal<i32> = ThreadLocal::new();
            plain.set(3);
            let inherited = Inherited::capture().unwrap();
            assert!(inherited.is_empty());
        });
    }

    /// Invariant: the child starts from the transformed parent value; the
    /// parent's value is left alone.
    #[test]
    fn child_sees_transformed_value() {
        on_fresh_thread(|| {
            let depth = Arc::new(ThreadLocal::builder(|| 0u32).inherit(|d| d + 1).build());
            depth.set(4);
            let d = depth.clone();
            let child = spawn(move || *d.get()).join().unwrap();
            assert_eq!(child, 5);
            assert_eq!(*depth.get(), 4);
        });
    }

    /// Invariant: a handle dropped before the fork is tombstoned in the
    /// parent as well as in the snapshot.
    #[test]
    fn cleared_handle_buried_in_parent_and_child() {
        on_fresh_thread(|| {
            let gone: ThreadLocal<i32> = Builder::new(|| 0)
                .inherit_clone()
                .hash(KeyHash::from_raw(2 * 3))
                .build();
            let kept: ThreadLocal<i32> = Builder::new(|| 0)
                .inherit_clone()
                .hash(KeyHash::from_raw(2 * 9))
                .build();
            gone.set(1);
            kept.set(2);
            drop(gone);

            let inherited = Inherited::capture().unwrap();
            let child = inherited.store.as_ref().unwrap();
            assert!(child.slot_is_tombstone(3));
            assert_eq!(child.stats().size, 1);
            assert_eq!(child.stats().tombstones, 1);
            child.assert_invariants();

            let parent = kept.stats().unwrap();
            assert_eq!(parent.size, 1);
            assert_eq!(parent.tombstones, 1);
            assert_eq!(inherited.len(), 1);
        });
    }

    /// Invariant: a failing transform aborts the fork and leaves the parent's
    /// value intact.
    #[test]
    fn failing_transform_aborts_capture() {
        on_fresh_thread(|| {
            let tl: ThreadLocal<i32> = ThreadLocal::builder(|| 0)
                .try_inherit(|v| if *v < 0 { Err("negative") } else { Ok(*v) })
                .build();
            tl.set(-1);
            match Inherited::capture() {
                Err(AccessError::Init(e)) => assert_eq!(e.to_string(), "negative"),
                other => panic!("unexpected: {other:?}"),
            }
            assert_eq!(*tl.get(), -1);

            match spawn_with(thread::Builder::new(), || ()) {
                Err(SpawnError::Inherit(AccessError::Init(_))) => {}
                other => panic!("unexpected: {other:?}"),
            }
        });
    }

    /// Invariant: installing replaces the thread's inheritable store.
    #[test]
    fn install_replaces_existing_values() {
        on_fresh_thread(|| {
            let tl = Arc::new(ThreadLocal::builder(|| 0).inherit_clone().build());
            tl.set(1);
            let inherited = Inherited::capture().unwrap();
            tl.set(2);
            inherited.install().unwrap();
            assert_eq!(*tl.get(), 1);
        });
    }

    #[test]
    fn debug_reports_len() {
        on_fresh_thread(|| {
            let tl: ThreadLocal<u8> = ThreadLocal::builder(|| 1).inherit_clone().build();
            let _ = tl.get();
            let inherited = Inherited::capture().unwrap();
            assert_eq!(format!("{inherited:?}"), "Inherited { len: 1 }");
        });
    }
}
