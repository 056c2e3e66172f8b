use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::error::LockError;
use crate::key::Key;
use crate::store::PersistingStore;

/// A lock on one resource, backed by a store.
///
/// The store is the only source of truth. `Lock` keeps the key and a
/// `dirty` hint used to decide whether dropping the lock should release it.
pub struct Lock {
    key: Key,
    store: Arc<dyn PersistingStore>,
    ttl: Option<Duration>,
    auto_release: bool,
    dirty: bool,
    retry: RetryPolicy,
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.key)
            .field("store", &self.store.store_name())
            .field("ttl", &self.ttl)
            .field("auto_release", &self.auto_release)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Lock {
    /// # Arguments
    /// * `key` - Key identifying the resource, owned by this lock
    /// * `store` - Store arbitrating the lock
    /// * `ttl` - Lifetime set on acquisition; `None` never expires
    /// * `auto_release` - Release the lock when dropped while held
    pub fn new(
        key: Key,
        store: Arc<dyn PersistingStore>,
        ttl: Option<Duration>,
        auto_release: bool,
    ) -> Self {
        Self {
            key,
            store,
            ttl,
            auto_release,
            dirty: false,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn resource(&self) -> &str {
        self.key.resource()
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Acquire the exclusive lock.
    ///
    /// Returns `Ok(false)` when a non-blocking attempt lost to another
    /// holder. A blocking attempt waits in the store when it can, otherwise
    /// retries with the configured delay; a conflict it still reports is
    /// returned as `LockError::Conflicted`.
    pub async fn acquire(&mut self, blocking: bool) -> Result<bool, LockError> {
        self.key.reset_lifetime();
        let outcome = self.try_acquire(false, blocking).await;
        self.conclude(outcome, blocking)
    }

    /// Acquire a shared lock, or the exclusive one on stores without shared locks.
    pub async fn acquire_read(&mut self, blocking: bool) -> Result<bool, LockError> {
        if self.store.as_shared().is_none() {
            debug!(
                "Store \"{}\" does not support read locks, falling back to a write lock for \"{}\".",
                self.store.store_name(),
                self.key
            );
            return self.acquire(blocking).await;
        }

        self.key.reset_lifetime();
        let outcome = self.try_acquire(true, blocking).await;
        self.conclude(outcome, blocking)
    }

    async fn try_acquire(&mut self, read: bool, blocking: bool) -> Result<(), LockError> {
        let store = Arc::clone(&self.store);

        match (read, blocking) {
            (false, false) => store.save(&mut self.key).await?,
            (false, true) => match store.as_blocking() {
                Some(blocking_store) => blocking_store.wait_and_save(&mut self.key).await?,
                None => self.spin(false).await?,
            },
            (true, false) => match store.as_shared() {
                Some(shared) => shared.save_read(&mut self.key).await?,
                None => store.save(&mut self.key).await?,
            },
            (true, true) => match store.as_blocking_shared() {
                Some(blocking_store) => blocking_store.wait_and_save_read(&mut self.key).await?,
                None => self.spin(true).await?,
            },
        }

        self.dirty = true;
        debug!("Successfully acquired the \"{}\" lock.", self.key);

        if self.ttl.is_some() {
            self.refresh(None).await?;
        }

        if self.key.is_expired() {
            if let Err(e) = self.release().await {
                debug!("Failed to release the expired \"{}\" lock: {}", self.key, e);
            }
            return Err(LockError::Expired(format!(
                "Failed to store the \"{}\" lock.",
                self.key
            )));
        }

        Ok(())
    }

    /// Retry a non-blocking save until it stops conflicting.
    async fn spin(&mut self, read: bool) -> Result<(), LockError> {
        let store = Arc::clone(&self.store);

        loop {
            let outcome = match (read, store.as_shared()) {
                (true, Some(shared)) => shared.save_read(&mut self.key).await,
                _ => store.save(&mut self.key).await,
            };

            match outcome {
                Err(e) if e.is_conflict() => tokio::time::sleep(self.retry.next_delay()).await,
                other => return other,
            }
        }
    }

    fn conclude(
        &mut self,
        outcome: Result<(), LockError>,
        blocking: bool,
    ) -> Result<bool, LockError> {
        match outcome {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => {
                self.dirty = false;
                info!(
                    "Failed to acquire the \"{}\" lock. Someone else already acquired the lock.",
                    self.key
                );
                if blocking {
                    Err(e)
                } else {
                    Ok(false)
                }
            }
            Err(e) if e.passes_through() => {
                warn!("Failed to acquire the \"{}\" lock: {}", self.key, e);
                Err(e)
            }
            Err(e) => {
                warn!("Failed to acquire the \"{}\" lock: {}", self.key, e);
                Err(LockError::Acquiring {
                    resource: self.key.resource().to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Put off the expiration of the lock to `ttl` (or the lock's own TTL) from now.
    pub async fn refresh(&mut self, ttl: Option<Duration>) -> Result<(), LockError> {
        let Some(ttl) = ttl.or(self.ttl) else {
            return Err(LockError::InvalidArgument(
                "You have to define an expiration duration.".to_string(),
            ));
        };

        self.key.reset_lifetime();
        match self.store.put_off_expiration(&mut self.key, ttl).await {
            Ok(()) => {
                self.dirty = true;

                if self.key.is_expired() {
                    if let Err(e) = self.release().await {
                        debug!("Failed to release the expired \"{}\" lock: {}", self.key, e);
                    }
                    return Err(LockError::Expired(format!(
                        "Failed to put off the expiration of the \"{}\" lock within the specified time.",
                        self.key
                    )));
                }

                debug!("Expiration defined for \"{}\" lock for {:?}.", self.key, ttl);
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                self.dirty = false;
                warn!(
                    "Failed to define an expiration for the \"{}\" lock, someone else acquired the lock.",
                    self.key
                );
                Err(e)
            }
            Err(e) if e.passes_through() => Err(e),
            Err(e) => {
                warn!("Failed to define an expiration for the \"{}\" lock: {}", self.key, e);
                Err(LockError::Acquiring {
                    resource: self.key.resource().to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Ask the store whether this lock is still held.
    ///
    /// Never answered from local state: the lock may have expired or been
    /// taken over since it was acquired.
    pub async fn is_acquired(&mut self) -> Result<bool, LockError> {
        self.dirty = self.store.exists(&mut self.key).await?;
        Ok(self.dirty)
    }

    /// Release the lock and confirm with the store that it is gone.
    pub async fn release(&mut self) -> Result<(), LockError> {
        match self.try_release().await {
            Ok(()) => {
                debug!("Successfully released the \"{}\" lock.", self.key);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to release the \"{}\" lock: {}", self.key, e);
                Err(e)
            }
        }
    }

    async fn try_release(&mut self) -> Result<(), LockError> {
        let resource = self.key.resource().to_string();

        if let Err(e) = self.store.delete(&mut self.key).await {
            return Err(match e {
                LockError::Releasing { .. } => e,
                other => LockError::Releasing {
                    resource,
                    reason: "the store failed to delete it".to_string(),
                    source: Some(Box::new(other)),
                },
            });
        }
        self.dirty = false;

        // Deletion is not confirmed by every store (e.g. across a partition)
        let still_locked = self
            .store
            .exists(&mut self.key)
            .await
            .map_err(|e| LockError::Releasing {
                resource: resource.clone(),
                reason: "the release could not be confirmed".to_string(),
                source: Some(Box::new(e)),
            })?;

        if still_locked {
            return Err(LockError::Releasing {
                resource,
                reason: "the resource is still locked".to_string(),
                source: None,
            });
        }

        Ok(())
    }

    pub fn is_expired(&self) -> bool {
        self.key.is_expired()
    }

    pub fn remaining_lifetime(&self) -> Option<TimeDelta> {
        self.key.remaining_lifetime()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Release on the current runtime without waiting for the outcome.
    pub(crate) fn release_in_background(&mut self) {
        self.dirty = false;

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "The \"{}\" lock was dropped outside of a runtime and cannot be released",
                self.key
            );
            return;
        };

        let mut key = self.key.clone();
        let store = Arc::clone(&self.store);
        handle.spawn(async move {
            match store.exists(&mut key).await {
                Ok(true) => match store.delete(&mut key).await {
                    Ok(()) => debug!("Released the dropped \"{}\" lock.", key),
                    Err(e) => warn!("Failed to release the dropped \"{}\" lock: {}", key, e),
                },
                Ok(false) => {}
                Err(e) => warn!("Failed to check the dropped \"{}\" lock: {}", key, e),
            }
        });
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if self.auto_release && self.dirty {
            self.release_in_background();
        }
    }
}
