use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::traits::{PersistingStore, SharedLockStore};
use super::unique_token;
use crate::error::LockError;
use crate::key::Key;

const NAMESPACE: &str = "memory";

#[derive(Debug, Default)]
struct Locks {
    /// resource -> token of the exclusive holder
    writers: HashMap<String, String>,
    /// resource -> tokens of the shared holders
    readers: HashMap<String, HashSet<String>>,
}

/// Process-local store. Locks never expire on their own.
///
/// Both maps sit behind one mutex so promotion and demotion are atomic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    locks: Mutex<Locks>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locks(&self) -> Result<MutexGuard<'_, Locks>, LockError> {
        self.locks
            .lock()
            .map_err(|_| LockError::Internal("in-memory lock table poisoned".to_string()))
    }
}

#[async_trait]
impl PersistingStore for InMemoryStore {
    fn store_name(&self) -> &'static str {
        NAMESPACE
    }

    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        let token = unique_token(key, NAMESPACE);
        let resource = key.resource().to_string();
        let mut locks = self.locks()?;

        if let Some(holder) = locks.writers.get(&resource) {
            if *holder == token {
                return Ok(());
            }
            debug!("Lock on {} held by another writer", resource);
            return Err(LockError::conflicted(&resource));
        }

        let readers = locks.readers.get(&resource);
        let sole_reader = readers.is_some_and(|r| r.len() == 1 && r.contains(&token));
        if sole_reader {
            // Promote our read lock
            locks.readers.remove(&resource);
        } else if readers.is_some_and(|r| !r.is_empty()) {
            debug!("Lock on {} held by readers", resource);
            return Err(LockError::conflicted(&resource));
        }

        locks.writers.insert(resource, token);
        Ok(())
    }

    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
        let token = unique_token(key, NAMESPACE);
        let resource = key.resource();
        let mut locks = self.locks()?;

        if let Some(readers) = locks.readers.get_mut(resource) {
            readers.remove(&token);
            if readers.is_empty() {
                locks.readers.remove(resource);
            }
        }

        if locks.writers.get(resource) == Some(&token) {
            locks.writers.remove(resource);
        }

        Ok(())
    }

    async fn exists(&self, key: &mut Key) -> Result<bool, LockError> {
        let token = unique_token(key, NAMESPACE);
        let resource = key.resource();
        let locks = self.locks()?;

        let reading = locks
            .readers
            .get(resource)
            .is_some_and(|readers| readers.contains(&token));
        Ok(reading || locks.writers.get(resource) == Some(&token))
    }

    async fn put_off_expiration(&self, _key: &mut Key, _ttl: Duration) -> Result<(), LockError> {
        Ok(())
    }

    fn as_shared(&self) -> Option<&dyn SharedLockStore> {
        Some(self)
    }
}

#[async_trait]
impl SharedLockStore for InMemoryStore {
    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn save_read(&self, key: &mut Key) -> Result<(), LockError> {
        let token = unique_token(key, NAMESPACE);
        let resource = key.resource().to_string();
        let mut locks = self.locks()?;

        if let Some(holder) = locks.writers.get(&resource) {
            if *holder != token {
                debug!("Read lock on {} blocked by a writer", resource);
                return Err(LockError::conflicted(&resource));
            }
            // Demote our write lock
            locks.writers.remove(&resource);
        }

        locks.readers.entry(resource).or_default().insert(token);
        Ok(())
    }
}
