//! Adaptive parameters shared between a callback and the losses it drives.
//!
//! A callback owns each [`AdaptiveParam`] and is its only writer. Losses hold
//! [`ParamReader`]s and read once per batch. Writes happen at epoch end only,
//! so every batch of epoch `n` sees the value written at the end of epoch `n - 1`.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

/// Writable handle to a shared adaptive value. Deliberately not `Clone`.
#[derive(Debug)]
pub struct AdaptiveParam<T> {
    inner: Arc<RwLock<T>>,
}

/// Read-only handle to an [`AdaptiveParam`].
#[derive(Debug)]
pub struct ParamReader<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for ParamReader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> AdaptiveParam<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    pub fn reader(&self) -> ParamReader<T> {
        ParamReader {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn set(&self, value: T) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Applies `update` to the stored value in place.
    pub fn update<F: FnOnce(&mut T)>(&self, update: F) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut *guard);
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Copy> AdaptiveParam<T> {
    pub fn get(&self) -> T {
        *self.read()
    }
}

impl<T> ParamReader<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Copy> ParamReader<T> {
    pub fn get(&self) -> T {
        *self.read()
    }
}
