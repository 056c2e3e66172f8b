use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockError;
use crate::key::Key;

/// A backend that persists lock state and arbitrates conflicting claims.
///
/// The store is the authority: a `Lock` never trusts local state over what
/// `exists` reports. Optional capabilities are discovered through the
/// `as_*` probes rather than by downcasting.
#[async_trait]
pub trait PersistingStore: Send + Sync {
    /// Returns the store identifier (e.g., "memory", "flock", "lease").
    fn store_name(&self) -> &'static str;

    /// Acquire the exclusive lock for `key`.
    ///
    /// Fails with `LockError::Conflicted` when someone else holds it.
    async fn save(&self, key: &mut Key) -> Result<(), LockError>;

    /// Release whatever `key` holds. Silently succeeds if nothing is held.
    async fn delete(&self, key: &mut Key) -> Result<(), LockError>;

    /// Whether `key` currently holds the lock in this store.
    async fn exists(&self, key: &mut Key) -> Result<bool, LockError>;

    /// Extend the lease held by `key` to `ttl` from now.
    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<(), LockError>;

    fn as_blocking(&self) -> Option<&dyn BlockingStore> {
        None
    }

    fn as_shared(&self) -> Option<&dyn SharedLockStore> {
        None
    }

    fn as_blocking_shared(&self) -> Option<&dyn BlockingSharedLockStore> {
        None
    }
}

/// A store able to wait until the exclusive lock becomes available.
#[async_trait]
pub trait BlockingStore: PersistingStore {
    async fn wait_and_save(&self, key: &mut Key) -> Result<(), LockError>;
}

/// A store supporting shared (read) locks next to exclusive ones.
#[async_trait]
pub trait SharedLockStore: PersistingStore {
    /// Acquire a shared lock. Multiple readers may hold it; writers are excluded.
    async fn save_read(&self, key: &mut Key) -> Result<(), LockError>;
}

/// A shared-lock store able to wait for a read lock.
#[async_trait]
pub trait BlockingSharedLockStore: SharedLockStore {
    async fn wait_and_save_read(&self, key: &mut Key) -> Result<(), LockError>;
}

/// Look up the blocking capability, failing when the store lacks it.
pub fn require_blocking(store: &dyn PersistingStore) -> Result<&dyn BlockingStore, LockError> {
    store.as_blocking().ok_or_else(|| {
        LockError::NotSupported(format!(
            "The store \"{}\" does not support blocking locks.",
            store.store_name()
        ))
    })
}
