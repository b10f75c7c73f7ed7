//! thread-slots: per-thread variables backed by a self-cleaning
//! open-addressing table, with value inheritance for child threads.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: give any number of independent handles a distinct value per
//!   thread, without parameter threading, while tolerating handles being
//!   created and dropped concurrently from any thread.
//! - Layers:
//!   - KeyHash: process-wide atomic counter handing each handle an even
//!     hash, stepped by the Fibonacci constant so successive handles land
//!     in well separated buckets.
//!   - Store<V>: single-owner open-addressing table of slot pairs keyed by
//!     weak references to handles. Owns tombstones, incremental sweeping,
//!     rehashing and growth.
//!   - ThreadLocal<T>: public handle. Resolves the calling thread's store
//!     and performs one probe operation per call.
//!   - Inherited / spawn: forks the parent's inheritable store into a child
//!     thread, applying each handle's transform.
//!
//! Constraints
//! - A store is touched by exactly one thread; no locks or atomics on the
//!   access path.
//! - Capacity is a power of two of at least 16 pairs and never shrinks.
//! - `size + tombstones <= max_load` (2/3 of capacity) after every mutation.
//! - A live pair is reachable from its bucket by linear probing without
//!   crossing an empty slot; no handle has two live pairs.
//!
//! Reclamation
//! - Keys are `Weak` references. A handle dropped on any thread only ever
//!   turns its keys from live to cleared; a cleared key reads as absent and
//!   is tombstoned by the next sweep, rehash or fork that visits it.
//! - Each mutating call sweeps `log2(capacity)` slots from a persisted
//!   cursor, so reclamation costs O(log n) per call instead of O(n).
//!
//! Reentrancy policy
//! - Stores live in a `thread_local!` `RefCell`. Initial-value factories,
//!   inheritance transforms and value destructors always run with the cell
//!   released, so they may use other thread locals.
//! - The miss path remembers the vacancy it found; if the factory changed
//!   the store, the value is installed through a full `put` instead.
//!
//! Inheritance
//! - Each thread has a plain store and an inheritable store. Only the
//!   inheritable one is forked, so values of plain handles never reach a
//!   child thread, which starts them from their factories.
//!
//! Notes and non-goals
//! - Not a general-purpose concurrent map.
//! - Dropping a handle does not eagerly visit other threads' stores.
//! - Values are handed out as `Rc<T>`; mutate through interior mutability.

mod error;
mod handle;
mod hash;
mod inherit;
mod store;
mod store_proptest;

// Public surface
pub use error::{AccessError, InitError, SpawnError};
pub use handle::{Builder, ThreadLocal};
pub use inherit::{spawn, spawn_with, Inherited};
pub use store::StoreStats;
