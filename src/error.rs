//! Error types surfaced by thread-local access and thread spawning.

use std::error::Error as StdError;
use thiserror::Error;

/// Failure reported by a fallible initial-value factory or inheritance
/// transform.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct InitError(Box<dyn StdError + Send + Sync>);

impl InitError {
    pub fn new<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        InitError(err.into())
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.0
    }
}

/// Error returned by the `try_*` accessors of [`ThreadLocal`](crate::ThreadLocal).
#[derive(Debug, Error)]
pub enum AccessError {
    /// The calling thread is tearing down its thread-local storage.
    #[error("thread-local storage of the current thread has been destroyed")]
    Destroyed,
    /// The initial-value factory or an inheritance transform failed.
    #[error("failed to compute thread-local value")]
    Init(#[from] InitError),
}

/// Error returned by [`spawn_with`](crate::spawn_with).
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn thread")]
    Io(#[from] std::io::Error),
    #[error("failed to capture inheritable thread-local values")]
    Inherit(#[from] AccessError),
}
