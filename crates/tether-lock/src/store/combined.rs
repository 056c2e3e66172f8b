use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::check_not_expired;
use super::strategy::Strategy;
use super::traits::{PersistingStore, SharedLockStore};
use crate::error::LockError;
use crate::key::Key;

/// Quorum lock over several independent stores.
///
/// A lock is held when the configured `Strategy` is met, e.g. a majority of
/// lease stores on different volumes agree.
#[derive(Clone)]
pub struct CombinedStore {
    stores: Vec<Arc<dyn PersistingStore>>,
    strategy: Arc<dyn Strategy>,
}

impl std::fmt::Debug for CombinedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedStore")
            .field(
                "stores",
                &self.stores.iter().map(|s| s.store_name()).collect::<Vec<_>>(),
            )
            .field("strategy", &self.strategy)
            .finish()
    }
}

enum Claim {
    Exclusive,
    Shared,
}

impl CombinedStore {
    pub fn new(
        stores: Vec<Arc<dyn PersistingStore>>,
        strategy: impl Strategy + 'static,
    ) -> Result<Self, LockError> {
        if stores.is_empty() {
            return Err(LockError::InvalidArgument(
                "CombinedStore requires at least one store".to_string(),
            ));
        }

        Ok(Self {
            stores,
            strategy: Arc::new(strategy),
        })
    }

    async fn claim(&self, key: &mut Key, claim: Claim) -> Result<(), LockError> {
        let total = self.stores.len();
        let mut success = 0;
        let mut failure = 0;

        for store in &self.stores {
            let outcome = match (&claim, store.as_shared()) {
                (Claim::Shared, Some(shared)) => shared.save_read(key).await,
                _ => store.save(key).await,
            };

            match outcome {
                Ok(()) => success += 1,
                Err(e) => {
                    debug!(
                        "One store failed to save the \"{}\" lock ({}): {}",
                        key,
                        store.store_name(),
                        e
                    );
                    failure += 1;
                }
            }

            if !self.strategy.can_be_met(failure, total) {
                break;
            }
        }

        check_not_expired(self, key).await?;

        if self.strategy.is_met(success, total) {
            return Ok(());
        }

        warn!(
            "Failed to store the \"{}\" lock. Quorum has not been met ({}/{}).",
            key, success, total
        );

        // Roll back the stores that did accept the claim
        self.delete(key).await?;

        Err(LockError::conflicted(key))
    }
}

#[async_trait]
impl PersistingStore for CombinedStore {
    fn store_name(&self) -> &'static str {
        "combined"
    }

    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        self.claim(key, Claim::Exclusive).await
    }

    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
        for store in &self.stores {
            if let Err(e) = store.delete(key).await {
                warn!(
                    "One store failed to delete the \"{}\" lock ({}): {}",
                    key,
                    store.store_name(),
                    e
                );
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &mut Key) -> Result<bool, LockError> {
        let total = self.stores.len();
        let mut success = 0;
        let mut failure = 0;

        for store in &self.stores {
            match store.exists(key).await {
                Ok(true) => success += 1,
                Ok(false) => failure += 1,
                Err(e) => {
                    debug!("One store failed to check the \"{}\" lock: {}", key, e);
                    failure += 1;
                }
            }

            if self.strategy.is_met(success, total) {
                return Ok(true);
            }
            if !self.strategy.can_be_met(failure, total) {
                return Ok(false);
            }
        }

        Ok(false)
    }

    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<(), LockError> {
        let total = self.stores.len();
        let mut success = 0;
        let mut failure = 0;
        let deadline = Instant::now() + ttl;

        for store in &self.stores {
            let adjusted = deadline.saturating_duration_since(Instant::now());
            if adjusted.is_zero() {
                debug!(
                    "Stores took too long to put off the expiration of the \"{}\" lock.",
                    key
                );
                key.reduce_lifetime(Duration::ZERO);
                break;
            }

            match store.put_off_expiration(key, adjusted).await {
                Ok(()) => success += 1,
                Err(e) => {
                    debug!(
                        "One store failed to put off the expiration of the \"{}\" lock: {}",
                        key, e
                    );
                    failure += 1;
                }
            }

            if !self.strategy.can_be_met(failure, total) {
                break;
            }
        }

        check_not_expired(self, key).await?;

        if self.strategy.is_met(success, total) {
            return Ok(());
        }

        warn!(
            "Failed to define the expiration for the \"{}\" lock. Quorum has not been met ({}/{}).",
            key, success, total
        );
        Err(LockError::conflicted(key))
    }

    fn as_shared(&self) -> Option<&dyn SharedLockStore> {
        Some(self)
    }
}

#[async_trait]
impl SharedLockStore for CombinedStore {
    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn save_read(&self, key: &mut Key) -> Result<(), LockError> {
        self.claim(key, Claim::Shared).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConsensusStrategy, InMemoryStore, UnanimousStrategy};

    fn memory_stores(count: usize) -> Vec<Arc<InMemoryStore>> {
        (0..count).map(|_| Arc::new(InMemoryStore::new())).collect()
    }

    fn erase(stores: &[Arc<InMemoryStore>]) -> Vec<Arc<dyn PersistingStore>> {
        stores
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn PersistingStore>)
            .collect()
    }

    #[test]
    fn test_requires_a_store() {
        let err = CombinedStore::new(Vec::new(), UnanimousStrategy).unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_consensus_tolerates_a_minority() {
        let stores = memory_stores(3);
        let combined = CombinedStore::new(erase(&stores), ConsensusStrategy).unwrap();

        // Someone holds the lock in one of the three stores
        let mut squatter = Key::new("invoices");
        stores[0].save(&mut squatter).await.unwrap();

        let mut key = Key::new("invoices");
        combined.save(&mut key).await.unwrap();
        assert!(combined.exists(&mut key).await.unwrap());
    }

    #[tokio::test]
    async fn test_unanimous_rolls_back_partial_claims() {
        let stores = memory_stores(3);
        let combined = CombinedStore::new(erase(&stores), UnanimousStrategy).unwrap();

        let mut squatter = Key::new("invoices");
        stores[2].save(&mut squatter).await.unwrap();

        let mut key = Key::new("invoices");
        let err = combined.save(&mut key).await.unwrap_err();
        assert!(err.is_conflict());

        // The stores that accepted were rolled back
        assert!(!stores[0].exists(&mut key).await.unwrap());
        assert!(!stores[1].exists(&mut key).await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_claims() {
        let stores = memory_stores(3);
        let combined = CombinedStore::new(erase(&stores), ConsensusStrategy).unwrap();

        let mut reader_a = Key::new("invoices");
        let mut reader_b = Key::new("invoices");
        let mut writer = Key::new("invoices");

        combined.save_read(&mut reader_a).await.unwrap();
        combined.save_read(&mut reader_b).await.unwrap();
        assert!(combined.save(&mut writer).await.unwrap_err().is_conflict());

        combined.delete(&mut reader_a).await.unwrap();
        combined.delete(&mut reader_b).await.unwrap();
        combined.save(&mut writer).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_off_expiration_reaches_every_store() {
        let stores = memory_stores(2);
        let combined = CombinedStore::new(erase(&stores), UnanimousStrategy).unwrap();

        let mut key = Key::new("invoices");
        combined.save(&mut key).await.unwrap();
        combined
            .put_off_expiration(&mut key, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!key.is_expired());
    }
}
