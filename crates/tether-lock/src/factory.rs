use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::LockConfig;
use crate::key::Key;
use crate::lock::Lock;
use crate::store::PersistingStore;

/// Creates locks sharing one store and one set of defaults.
#[derive(Clone)]
pub struct LockFactory {
    store: Arc<dyn PersistingStore>,
    config: LockConfig,
}

impl std::fmt::Debug for LockFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFactory")
            .field("store", &self.store.store_name())
            .field("config", &self.config)
            .finish()
    }
}

impl LockFactory {
    pub fn new(store: Arc<dyn PersistingStore>) -> Self {
        Self::with_config(store, LockConfig::default())
    }

    pub fn with_config(store: Arc<dyn PersistingStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn PersistingStore> {
        &self.store
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Lock `resource` with the configured TTL and auto-release setting.
    pub fn create_lock(&self, resource: impl Into<String>) -> Lock {
        self.create_lock_from_key(
            Key::new(resource),
            self.config.default_ttl(),
            self.config.auto_release,
        )
    }

    pub fn create_lock_with(
        &self,
        resource: impl Into<String>,
        ttl: Option<Duration>,
        auto_release: bool,
    ) -> Lock {
        self.create_lock_from_key(Key::new(resource), ttl, auto_release)
    }

    /// Build a lock around an existing key, e.g. one handed over by another process.
    pub fn create_lock_from_key(
        &self,
        key: Key,
        ttl: Option<Duration>,
        auto_release: bool,
    ) -> Lock {
        debug!("Creating a \"{}\" lock.", key);
        Lock::new(key, Arc::clone(&self.store), ttl, auto_release).with_retry(self.config.retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::store::InMemoryStore;

    fn factory(config: LockConfig) -> LockFactory {
        LockFactory::with_config(Arc::new(InMemoryStore::new()), config)
    }

    #[test]
    fn test_create_lock_uses_defaults() {
        let lock = LockFactory::new(Arc::new(InMemoryStore::new())).create_lock("invoices");
        assert_eq!(lock.resource(), "invoices");
        assert_eq!(lock.ttl(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_create_lock_with_overrides() {
        let factory = factory(LockConfig::default());
        let lock = factory.create_lock_with("invoices", None, false);
        assert_eq!(lock.ttl(), None);
    }

    #[tokio::test]
    async fn test_locks_share_the_store() {
        let factory = factory(LockConfig {
            default_ttl_secs: Some(30),
            auto_release: false,
            retry: RetryPolicy::default(),
        });

        let mut first = factory.create_lock("invoices");
        let mut second = factory.create_lock("invoices");
        let mut other = factory.create_lock("reports");

        assert!(first.acquire(false).await.unwrap());
        assert!(!second.acquire(false).await.unwrap());
        assert!(other.acquire(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_lock_from_key_keeps_state() {
        let factory = factory(LockConfig::default());
        let mut key = Key::new("invoices");
        key.set_state("custom", serde_json::json!("value"));

        let lock = factory.create_lock_from_key(key, Some(Duration::from_secs(5)), false);
        assert_eq!(lock.key().state("custom"), Some(&serde_json::json!("value")));
        assert_eq!(lock.ttl(), Some(Duration::from_secs(5)));
    }
}
