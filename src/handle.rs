//! ThreadLocal: the public handle and the per-thread slot holding its stores.
//!
//! Each thread owns two stores, created lazily: one for plain handles and
//! one for inheritable handles. Only the inheritable store is copied into
//! child threads, so plain values never cross a fork.
//!
//! The stores sit in a `thread_local!` `RefCell`. User code (factories,
//! transforms and value destructors) never runs while that cell is
//! borrowed, so it may freely use other thread locals.

use crate::error::{AccessError, InitError};
use crate::hash::KeyHash;
use crate::store::{Key, Lookup, SlotKey, Store, StoreStats};
use core::cell::RefCell;
use core::convert::Infallible;
use core::fmt;
use core::marker::PhantomData;
use std::any::Any;
use std::error::Error as StdError;
use std::rc::Rc;
use std::sync::{Arc, Weak};

pub(crate) type ThreadStore = Store<Rc<dyn Any>>;

type InitFn<T> = Box<dyn Fn() -> Result<T, InitError> + Send + Sync>;
type ChildFn = Box<dyn Fn(&dyn Any) -> Result<Box<dyn Any + Send>, InitError> + Send + Sync>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum StoreKind {
    Local,
    Inheritable,
}

#[derive(Default)]
pub(crate) struct ThreadValues {
    local: Option<ThreadStore>,
    inheritable: Option<ThreadStore>,
}

impl ThreadValues {
    pub(crate) fn store(&mut self, kind: StoreKind) -> &mut Option<ThreadStore> {
        match kind {
            StoreKind::Local => &mut self.local,
            StoreKind::Inheritable => &mut self.inheritable,
        }
    }

    fn store_or_new(&mut self, kind: StoreKind) -> &mut ThreadStore {
        self.store(kind).get_or_insert_with(Store::new)
    }

    fn take_evicted(&mut self) -> Vec<Rc<dyn Any>> {
        let mut evicted = Vec::new();
        for store in [&mut self.local, &mut self.inheritable].into_iter().flatten() {
            evicted.append(&mut store.take_evicted());
        }
        evicted
    }
}

thread_local! {
    static VALUES: RefCell<ThreadValues> = RefCell::new(ThreadValues::default());
}

/// Run `f` against the calling thread's stores. Values evicted by `f` are
/// dropped after the borrow is released.
pub(crate) fn with_values<R>(f: impl FnOnce(&mut ThreadValues) -> R) -> Result<R, AccessError> {
    VALUES
        .try_with(|cell| {
            let (result, evicted) = {
                let mut values = cell.borrow_mut();
                let result = f(&mut values);
                (result, values.take_evicted())
            };
            drop(evicted);
            result
        })
        .map_err(|_| AccessError::Destroyed)
}

struct Inner<T> {
    key: SlotKey,
    init: InitFn<T>,
    child: Option<ChildFn>,
    _value: PhantomData<fn() -> T>,
}

impl<T: 'static> Key for Inner<T> {
    fn child_value(&self, parent: &dyn Any) -> Result<Box<dyn Any + Send>, InitError> {
        match &self.child {
            Some(child) => child(parent),
            // Plain handles never live in an inheritable store.
            None => unreachable!("child value requested for a non-inheritable handle"),
        }
    }
}

/// A per-thread variable.
///
/// Every thread sees its own value, created on first access from the
/// handle's initial-value factory. Values are handed out as `Rc<T>`; use
/// interior mutability (`Cell`, `RefCell`) inside `T` to mutate in place.
///
/// Dropping the handle does not visit other threads. Their values are
/// released lazily as those threads keep using thread locals, or when the
/// threads exit.
pub struct ThreadLocal<T: 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Default + 'static> ThreadLocal<T> {
    /// A handle whose initial value is `T::default()`.
    pub fn new() -> Self {
        Builder::new(T::default).build()
    }
}

impl<T: Default + 'static> Default for ThreadLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> ThreadLocal<T> {
    /// A handle whose initial value on each thread comes from `init`.
    pub fn with_initial<F>(init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Builder::new(init).build()
    }

    /// Start configuring a handle; see [`Builder`].
    pub fn builder<F>(init: F) -> Builder<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Builder::new(init)
    }

    /// Whether threads started through [`spawn`](crate::spawn) inherit this
    /// handle's value.
    pub fn is_inheritable(&self) -> bool {
        self.inner.child.is_some()
    }

    fn kind(&self) -> StoreKind {
        if self.is_inheritable() {
            StoreKind::Inheritable
        } else {
            StoreKind::Local
        }
    }

    /// The calling thread's value, creating it if absent.
    ///
    /// # Panics
    ///
    /// If the initial-value factory fails, or if called while the thread's
    /// thread-local storage is being destroyed.
    pub fn get(&self) -> Rc<T> {
        match self.try_get() {
            Ok(v) => v,
            Err(e) => panic!("cannot access thread-local value: {e}"),
        }
    }

    /// Like [`get`](Self::get), but returns `AccessError::Init` when the
    /// factory fails and `AccessError::Destroyed` during thread teardown.
    pub fn try_get(&self) -> Result<Rc<T>, AccessError> {
        let kind = self.kind();
        let key = &self.inner.key;

        let probe = with_values(|values| {
            let store = values.store_or_new(kind);
            if let Some(v) = store.get(key) {
                return Ok(Rc::clone(v));
            }
            match store.lookup_after_miss(key) {
                Lookup::Hit(v) => Ok(Rc::clone(v)),
                Lookup::Miss(vacancy) => Err(vacancy),
            }
        })?;
        let vacancy = match probe {
            Ok(v) => return Ok(downcast(v)),
            Err(vacancy) => vacancy,
        };

        // Store released: the factory may use other thread locals.
        let value = Rc::new((self.inner.init)()?);
        let erased: Rc<dyn Any> = value.clone();
        with_values(|values| values.store_or_new(kind).install(key, erased, vacancy))?;
        Ok(value)
    }

    /// Run `f` with a reference to the calling thread's value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.get())
    }

    /// Replace the calling thread's value.
    ///
    /// # Panics
    ///
    /// If called while the thread's thread-local storage is being destroyed.
    pub fn set(&self, value: T) {
        if let Err(e) = self.try_set(value) {
            panic!("cannot set thread-local value: {e}");
        }
    }

    /// Like [`set`](Self::set), but returns `AccessError::Destroyed` during
    /// thread teardown instead of panicking.
    pub fn try_set(&self, value: T) -> Result<(), AccessError> {
        let kind = self.kind();
        let value: Rc<dyn Any> = Rc::new(value);
        with_values(|values| values.store_or_new(kind).put(self.inner.key.clone(), value))
    }

    /// Forget the calling thread's value; the next `get` re-runs the factory.
    ///
    /// # Panics
    ///
    /// If called while the thread's thread-local storage is being destroyed.
    pub fn remove(&self) {
        if let Err(e) = self.try_remove() {
            panic!("cannot remove thread-local value: {e}");
        }
    }

    /// Like [`remove`](Self::remove), but returns `AccessError::Destroyed`
    /// during thread teardown instead of panicking.
    pub fn try_remove(&self) -> Result<(), AccessError> {
        let kind = self.kind();
        with_values(|values| {
            if let Some(store) = values.store(kind) {
                store.remove(&self.inner.key);
            }
        })
    }

    /// Counters of the calling thread's store for this handle's kind.
    ///
    /// `None` if the thread has not created that store yet, or if its
    /// thread-local storage is being destroyed.
    pub fn stats(&self) -> Option<StoreStats> {
        let kind = self.kind();
        with_values(|values| values.store(kind).as_ref().map(Store::stats))
            .ok()
            .flatten()
    }
}

impl<T: 'static> fmt::Debug for ThreadLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocal")
            .field("inheritable", &self.is_inheritable())
            .finish_non_exhaustive()
    }
}

fn downcast<T: 'static>(value: Rc<dyn Any>) -> Rc<T> {
    match value.downcast::<T>() {
        Ok(v) => v,
        Err(_) => unreachable!("thread-local value does not match its handle's type"),
    }
}

/// Configures a [`ThreadLocal`] before it is created.
pub struct Builder<T: 'static> {
    init: InitFn<T>,
    child: Option<ChildFn>,
    #[cfg(test)]
    hash: Option<KeyHash>,
}

impl<T: 'static> Builder<T> {
    /// A builder for a non-inheritable handle with an infallible factory.
    pub fn new<F>(init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::from_init(Box::new(move || Ok(init())))
    }

    /// Use a factory that can fail; failures surface from `try_get` and
    /// leave the thread's value unset.
    pub fn fallible<F, E>(init: F) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::from_init(Box::new(move || init().map_err(InitError::new)))
    }

    fn from_init(init: InitFn<T>) -> Self {
        Self {
            init,
            child: None,
            #[cfg(test)]
            hash: None,
        }
    }

    /// Make the handle inheritable: threads created through
    /// [`spawn`](crate::spawn) start with `child(&parent_value)`.
    pub fn inherit<F>(self, child: F) -> Self
    where
        T: Send,
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        self.try_inherit(move |parent| Ok::<_, Infallible>(child(parent)))
    }

    /// Like [`inherit`](Self::inherit) with a transform that can fail; a
    /// failure aborts the fork.
    pub fn try_inherit<F, E>(mut self, child: F) -> Self
    where
        T: Send,
        F: Fn(&T) -> Result<T, E> + Send + Sync + 'static,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.child = Some(Box::new(move |parent: &dyn Any| {
            let parent = match parent.downcast_ref::<T>() {
                Some(p) => p,
                None => unreachable!("inherited value does not match its handle's type"),
            };
            let value = child(parent).map_err(InitError::new)?;
            Ok(Box::new(value) as Box<dyn Any + Send>)
        }));
        self
    }

    /// Inherit the parent's value unchanged.
    pub fn inherit_clone(self) -> Self
    where
        T: Clone + Send,
    {
        self.inherit(T::clone)
    }

    #[cfg(test)]
    pub(crate) fn hash(mut self, hash: KeyHash) -> Self {
        self.hash = Some(hash);
        self
    }

    /// Create the handle, allocating its hash.
    pub fn build(self) -> ThreadLocal<T> {
        #[cfg(test)]
        let hash = self.hash.unwrap_or_else(KeyHash::next);
        #[cfg(not(test))]
        let hash = KeyHash::next();

        let Builder { init, child, .. } = self;
        let inner = Arc::new_cyclic(|me: &Weak<Inner<T>>| {
            let weak: Weak<dyn Key> = me.clone();
            Inner {
                key: SlotKey::new(weak, hash),
                init,
                child,
                _value: PhantomData,
            }
        });
        ThreadLocal { inner }
    }
}
