//! Structural lock shared by the audio callback and the control thread.

use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

/// A mutex with two entry points.
///
/// The real-time side only ever calls [`RtLock::try_rt`]; when that returns
/// `None` the caller must skip the work guarded by the lock for this cycle.
/// The control side blocks in [`RtLock::lock`].
#[derive(Debug, Default)]
pub struct RtLock<T> {
    inner: Mutex<T>,
}

impl<T> RtLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Non-blocking acquisition for the audio callback.
    pub fn try_rt(&self) -> Option<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Blocking acquisition for structural changes. Never call from the
    /// audio callback.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
