use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fs2::FileExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use super::traits::{BlockingSharedLockStore, BlockingStore, PersistingStore, SharedLockStore};
use super::unique_token;
use crate::error::LockError;
use crate::key::Key;

const NAMESPACE: &str = "flock";
const MODE: &str = "flock.read";

/// Lock store using OS-level advisory file locks.
///
/// - Opens one lock file per resource and holds the handle while locked
/// - Closing the handle releases the lock
/// - Process crash automatically releases lock (OS closes file descriptors)
///
/// Lock files are stored at:
/// `{lock_dir}/tether.{slug}.{hash}.lock`
///
/// Flocks never expire, so TTLs are ignored.
#[derive(Debug)]
pub struct FlockStore {
    lock_dir: PathBuf,
    /// Open handles: key token -> lock file
    handles: DashMap<String, File>,
}

impl FlockStore {
    /// Create a store keeping its lock files in `lock_dir`, which must exist.
    pub fn new(lock_dir: impl AsRef<Path>) -> Result<Self, LockError> {
        let lock_dir = lock_dir.as_ref();
        let writable = std::fs::metadata(lock_dir)
            .map(|meta| meta.is_dir() && !meta.permissions().readonly())
            .unwrap_or(false);

        if !writable {
            return Err(LockError::InvalidArgument(format!(
                "The directory \"{}\" is not writable.",
                lock_dir.display()
            )));
        }

        Ok(Self {
            lock_dir: lock_dir.to_path_buf(),
            handles: DashMap::new(),
        })
    }

    pub fn in_temp_dir() -> Result<Self, LockError> {
        Self::new(std::env::temp_dir())
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Get the path to the lock file of a resource.
    fn lock_path(&self, resource: &str) -> PathBuf {
        let mut slug = String::with_capacity(resource.len());
        for c in resource.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                slug.push(c);
            } else if !slug.ends_with('-') {
                slug.push('-');
            }
        }
        let slug: String = slug.chars().take(50).collect();
        let digest = Sha256::digest(resource.as_bytes());

        self.lock_dir
            .join(format!("tether.{}.{}.lock", slug, hex::encode(&digest[..4])))
    }

    fn open(&self, resource: &str) -> Result<File, LockError> {
        let path = self.lock_path(resource);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                LockError::Io(format!("Failed to open lock file {}: {}", path.display(), e))
            })
    }

    async fn lock(&self, key: &mut Key, read: bool, blocking: bool) -> Result<(), LockError> {
        let token = unique_token(key, NAMESPACE);

        if self.handles.contains_key(&token) && key.state(MODE) == Some(&Value::Bool(read)) {
            // Already held in the requested mode
            return Ok(());
        }

        let existing = self.handles.remove(&token).map(|(_, file)| file);

        // Promotion and demotion reuse the handle; the OS may drop the
        // previous lock before granting the new one.
        let file = match existing {
            Some(file) => file,
            None => self.open(key.resource())?,
        };

        let (file, outcome) = if blocking {
            tokio::task::spawn_blocking(move || {
                let outcome = if read {
                    FileExt::lock_shared(&file)
                } else {
                    FileExt::lock_exclusive(&file)
                };
                (file, outcome)
            })
            .await
            .map_err(|e| LockError::Internal(format!("Blocking lock task failed: {}", e)))?
        } else {
            let outcome = if read {
                FileExt::try_lock_shared(&file)
            } else {
                FileExt::try_lock_exclusive(&file)
            };
            (file, outcome)
        };

        match outcome {
            Ok(()) => {
                self.handles.insert(token, file);
                key.set_state(MODE, Value::Bool(read));
                key.mark_unserializable();
                debug!("Acquired {} flock on {}", if read { "shared" } else { "exclusive" }, key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                key.remove_state(MODE);
                debug!("Flock on {} held by another handle", key);
                Err(LockError::conflicted(key))
            }
            Err(e) => {
                key.remove_state(MODE);
                Err(LockError::Io(format!("Failed to lock {}: {}", key, e)))
            }
        }
    }

    fn token(key: &Key) -> Option<&str> {
        key.state(NAMESPACE).and_then(Value::as_str)
    }
}

#[async_trait]
impl PersistingStore for FlockStore {
    fn store_name(&self) -> &'static str {
        NAMESPACE
    }

    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        self.lock(key, false, false).await
    }

    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
        let Some(token) = Self::token(key).map(str::to_string) else {
            return Ok(());
        };

        if let Some((_, file)) = self.handles.remove(&token) {
            // Dropping the handle releases the lock as well
            let _ = FileExt::unlock(&file);
            debug!("Released flock on {}", key);
        }
        key.remove_state(MODE);
        Ok(())
    }

    async fn exists(&self, key: &mut Key) -> Result<bool, LockError> {
        Ok(Self::token(key).is_some_and(|token| self.handles.contains_key(token)))
    }

    async fn put_off_expiration(&self, _key: &mut Key, _ttl: Duration) -> Result<(), LockError> {
        Ok(())
    }

    fn as_blocking(&self) -> Option<&dyn BlockingStore> {
        Some(self)
    }

    fn as_shared(&self) -> Option<&dyn SharedLockStore> {
        Some(self)
    }

    fn as_blocking_shared(&self) -> Option<&dyn BlockingSharedLockStore> {
        Some(self)
    }
}

#[async_trait]
impl BlockingStore for FlockStore {
    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn wait_and_save(&self, key: &mut Key) -> Result<(), LockError> {
        self.lock(key, false, true).await
    }
}

#[async_trait]
impl SharedLockStore for FlockStore {
    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn save_read(&self, key: &mut Key) -> Result<(), LockError> {
        self.lock(key, true, false).await
    }
}

#[async_trait]
impl BlockingSharedLockStore for FlockStore {
    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn wait_and_save_read(&self, key: &mut Key) -> Result<(), LockError> {
        self.lock(key, true, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (FlockStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FlockStore::new(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_rejects_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let err = FlockStore::new(temp_dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));
    }

    #[test]
    fn test_lock_path_is_sanitized() {
        let (store, temp) = setup();
        let path = store.lock_path("reports / daily?");
        let name = path.file_name().unwrap().to_str().unwrap();

        assert_eq!(path.parent().unwrap(), temp.path());
        assert!(name.starts_with("tether.reports-daily-."));
        assert!(name.ends_with(".lock"));

        // Same slug, different resource, different file
        assert_ne!(store.lock_path("reports/daily"), store.lock_path("reports:daily"));
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (store, _temp) = setup();
        let mut first = Key::new("invoices");
        let mut second = Key::new("invoices");

        store.save(&mut first).await.unwrap();
        assert!(store.exists(&mut first).await.unwrap());
        assert!(!first.is_serializable());

        // Same key re-saving is a no-op
        store.save(&mut first).await.unwrap();

        // Another handle cannot take it
        let err = store.save(&mut second).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(!store.exists(&mut second).await.unwrap());

        store.delete(&mut first).await.unwrap();
        assert!(!store.exists(&mut first).await.unwrap());

        store.save(&mut second).await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_locks() {
        let (store, _temp) = setup();
        let mut reader_a = Key::new("invoices");
        let mut reader_b = Key::new("invoices");
        let mut writer = Key::new("invoices");

        store.save_read(&mut reader_a).await.unwrap();
        store.save_read(&mut reader_b).await.unwrap();
        assert!(store.save(&mut writer).await.unwrap_err().is_conflict());

        store.delete(&mut reader_a).await.unwrap();
        store.delete(&mut reader_b).await.unwrap();
        store.save(&mut writer).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_and_save_blocks_until_released() {
        let (store, _temp) = setup();
        let store = Arc::new(store);

        let mut holder = Key::new("invoices");
        store.save(&mut holder).await.unwrap();

        let waiter_store = Arc::clone(&store);
        let waiter = tokio::spawn(async move {
            let mut key = Key::new("invoices");
            waiter_store.wait_and_save(&mut key).await.unwrap();
            key
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        store.delete(&mut holder).await.unwrap();
        let mut key = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter never acquired the lock")
            .unwrap();
        assert!(store.exists(&mut key).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_locking() {
        use tokio::sync::Barrier;

        let (store, _temp) = setup();
        let store = Arc::new(store);

        const NUM_TASKS: usize = 10;
        let barrier = Arc::new(Barrier::new(NUM_TASKS));
        let inside = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..NUM_TASKS {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            let inside = Arc::clone(&inside);
            let counter = Arc::clone(&counter);

            handles.push(tokio::spawn(async move {
                barrier.wait().await;

                let mut key = Key::new("shared-resource");
                store.wait_and_save(&mut key).await.expect("acquire failed");

                // Critical section: nobody else may be inside
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                counter.fetch_add(1, Ordering::SeqCst);

                store.delete(&mut key).await.expect("release failed");
            }));
        }

        for handle in handles {
            handle.await.expect("task panicked");
        }

        assert_eq!(counter.load(Ordering::SeqCst), NUM_TASKS);
    }
}
