use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;

use crate::error::LockError;
use crate::lock::Lock;

/// A held lock released when the scope ends.
///
/// Prefer `run` or `release` to release deterministically. Dropping a
/// `ScopedLock` still releases, but in the background on the current runtime.
#[derive(Debug)]
pub struct ScopedLock {
    lock: Lock,
}

impl ScopedLock {
    /// Acquire `lock` exclusively. Returns `None` when a non-blocking attempt lost.
    pub async fn acquire(mut lock: Lock, blocking: bool) -> Result<Option<Self>, LockError> {
        if lock.acquire(blocking).await? {
            Ok(Some(Self { lock }))
        } else {
            Ok(None)
        }
    }

    pub async fn acquire_read(mut lock: Lock, blocking: bool) -> Result<Option<Self>, LockError> {
        if lock.acquire_read(blocking).await? {
            Ok(Some(Self { lock }))
        } else {
            Ok(None)
        }
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn lock_mut(&mut self) -> &mut Lock {
        &mut self.lock
    }

    pub async fn refresh(&mut self, ttl: Option<Duration>) -> Result<(), LockError> {
        self.lock.refresh(ttl).await
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.lock.release().await
    }

    /// Run `fut` while holding the lock, then release it.
    ///
    /// The lock is released even if `fut` panics; the panic is resumed
    /// afterwards. A failed release is logged and does not mask the result.
    pub async fn run<F, T>(mut self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let outcome = AssertUnwindSafe(fut).catch_unwind().await;
        // Release failures are already logged by the lock
        let _ = self.lock.release().await;

        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if self.lock.is_dirty() {
            self.lock.release_in_background();
        }
    }
}
