use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, instrument, warn};

use super::traits::PersistingStore;
use super::{check_not_expired, unique_token};
use crate::error::LockError;
use crate::key::Key;

const NAMESPACE: &str = "lease";

pub const DEFAULT_GC_PROBABILITY: f64 = 0.01;
pub const DEFAULT_INITIAL_TTL: Duration = Duration::from_secs(300);

/// Expiring lock store backed by lease files.
///
/// Lease files are stored at:
/// `{lease_dir}/{sha256(resource)}.lease`
///
/// Each lease file contains JSON with the holder token and expiration.
/// This store relies on every writer sharing a clock for leases to expire at
/// the right time; leave TTL slack for clock drift between hosts.
///
/// Every read-modify-write of a lease runs under an exclusive advisory lock
/// on `{lease_dir}/{sha256(resource)}.lease.lock`, so at most one contender
/// can take over an expired lease. Guard files are left in place.
#[derive(Debug, Clone)]
pub struct LeaseStore {
    lease_dir: PathBuf,
    gc_probability: f64,
    initial_ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseFile {
    token: String,
    /// Milliseconds since the Unix epoch
    expires_at: i64,
}

impl LeaseFile {
    fn is_live(&self) -> bool {
        self.expires_at > chrono::Utc::now().timestamp_millis()
    }
}

impl LeaseStore {
    /// Create a LeaseStore with the default GC probability and initial TTL.
    pub fn new(lease_dir: impl AsRef<Path>) -> Result<Self, LockError> {
        Self::with_options(lease_dir, DEFAULT_GC_PROBABILITY, DEFAULT_INITIAL_TTL)
    }

    /// # Arguments
    /// * `gc_probability` - Chance in `[0, 1]` that a save prunes expired leases
    /// * `initial_ttl` - Lease granted by `save`, at least one second
    pub fn with_options(
        lease_dir: impl AsRef<Path>,
        gc_probability: f64,
        initial_ttl: Duration,
    ) -> Result<Self, LockError> {
        if !(0.0..=1.0).contains(&gc_probability) {
            return Err(LockError::InvalidArgument(format!(
                "LeaseStore requires gc_probability between 0 and 1, {} given",
                gc_probability
            )));
        }
        if initial_ttl < Duration::from_secs(1) {
            return Err(LockError::InvalidTtl(format!(
                "LeaseStore expects an initial TTL of at least 1 second, {:?} given",
                initial_ttl
            )));
        }

        Ok(Self {
            lease_dir: lease_dir.as_ref().to_path_buf(),
            gc_probability,
            initial_ttl,
        })
    }

    /// Get the path to a lease file.
    fn lease_path(&self, resource: &str) -> PathBuf {
        let digest = Sha256::digest(resource.as_bytes());
        self.lease_dir.join(format!("{}.lease", hex::encode(digest)))
    }

    fn guard_path(lease_path: &Path) -> PathBuf {
        lease_path.with_extension("lease.lock")
    }

    /// Take the exclusive guard of a lease, waiting for other holders.
    ///
    /// The guard is released when the returned handle is dropped.
    async fn guard(&self, lease_path: &Path) -> Result<File, LockError> {
        let path = Self::guard_path(lease_path);
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| {
                    LockError::Io(format!("Failed to open lease guard {}: {}", path.display(), e))
                })?;
            FileExt::lock_exclusive(&file).map_err(|e| {
                LockError::Io(format!("Failed to lock lease guard {}: {}", path.display(), e))
            })?;
            Ok(file)
        })
        .await
        .map_err(|e| LockError::Internal(format!("Lease guard task failed: {}", e)))?
    }

    fn expires_at(ttl: Duration) -> i64 {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        chrono::Utc::now().timestamp_millis().saturating_add(ttl_ms)
    }

    /// Ensure the lease directory exists.
    async fn ensure_lease_dir(&self) -> Result<(), LockError> {
        fs::create_dir_all(&self.lease_dir).await.map_err(|e| {
            LockError::Io(format!(
                "Failed to create lease dir {}: {}",
                self.lease_dir.display(),
                e
            ))
        })
    }

    /// Read the current lease file, if it exists.
    async fn read_lease(&self, resource: &str) -> Result<Option<LeaseFile>, LockError> {
        let path = self.lease_path(resource);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LockError::Io(format!("Failed to read lease file: {}", e))),
        };

        match serde_json::from_str::<LeaseFile>(&content) {
            Ok(lease) => Ok(Some(lease)),
            Err(e) => {
                warn!("Failed to parse lease file {}: {}", path.display(), e);
                // Corrupted lease file, remove it
                let _ = fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    /// Write a lease file atomically.
    async fn write_lease(&self, resource: &str, lease: &LeaseFile) -> Result<(), LockError> {
        let path = self.lease_path(resource);
        let temp_path = path.with_extension(format!("{}.tmp", lease.token));

        let content = serde_json::to_vec(lease).map_err(|e| {
            LockError::Serialization(format!("Failed to serialize lease: {}", e))
        })?;

        fs::write(&temp_path, &content)
            .await
            .map_err(|e| LockError::Io(format!("Failed to write lease file: {}", e)))?;

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| LockError::Io(format!("Failed to rename lease file: {}", e)))?;

        Ok(())
    }

    fn should_collect(&self) -> bool {
        self.gc_probability > 0.0
            && (self.gc_probability >= 1.0 || rand::random::<f64>() <= self.gc_probability)
    }

    /// Whether the lease file at `path` holds an expired or unreadable lease.
    async fn is_expired_at(path: &Path) -> bool {
        let Ok(content) = fs::read_to_string(path).await else {
            return false;
        };
        serde_json::from_str::<LeaseFile>(&content)
            .map(|lease| !lease.is_live())
            .unwrap_or(true)
    }

    /// Rewrite the lease for `key` unless another token holds it live.
    ///
    /// Must be called with the lease guard held.
    async fn renew_guarded(&self, key: &mut Key, ttl: Duration) -> Result<(), LockError> {
        key.reduce_lifetime(ttl);
        let token = unique_token(key, NAMESPACE);

        match self.read_lease(key.resource()).await? {
            None => {
                debug!("Lease on {} not found for renewal", key);
                return Err(LockError::conflicted(&*key));
            }
            Some(existing) if existing.token != token && existing.is_live() => {
                debug!("Lease on {} held by another token", key);
                return Err(LockError::conflicted(&*key));
            }
            Some(_) => {}
        }

        let lease = LeaseFile {
            token,
            expires_at: Self::expires_at(ttl),
        };
        self.write_lease(key.resource(), &lease).await?;
        debug!("Renewed lease on {} (new expiry: {})", key, lease.expires_at);
        Ok(())
    }

    /// Remove every expired lease. Returns how many were removed.
    pub async fn prune(&self) -> Result<usize, LockError> {
        let mut entries = match fs::read_dir(&self.lease_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(LockError::Io(format!("Failed to list leases: {}", e))),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LockError::Io(format!("Failed to list leases: {}", e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("lease") {
                continue;
            }

            if !Self::is_expired_at(&path).await {
                continue;
            }

            let _guard = match self.guard(&path).await {
                Ok(guard) => guard,
                Err(e) => {
                    debug!("Skipping lease {}: {}", path.display(), e);
                    continue;
                }
            };

            // Someone may have taken the lease over since the first look
            if Self::is_expired_at(&path).await && fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }

        debug!("Pruned {} expired leases in {}", removed, self.lease_dir.display());
        Ok(removed)
    }
}

#[async_trait]
impl PersistingStore for LeaseStore {
    fn store_name(&self) -> &'static str {
        NAMESPACE
    }

    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn save(&self, key: &mut Key) -> Result<(), LockError> {
        key.reduce_lifetime(self.initial_ttl);
        let token = unique_token(key, NAMESPACE);
        self.ensure_lease_dir().await?;

        let guard = self.guard(&self.lease_path(key.resource())).await?;
        let outcome = match self.read_lease(key.resource()).await {
            // A corrupted lease is discarded by read_lease and taken like a missing one
            Ok(None) => {
                let lease = LeaseFile {
                    token,
                    expires_at: Self::expires_at(self.initial_ttl),
                };
                self.write_lease(key.resource(), &lease)
                    .await
                    .map(|()| debug!("Created lease on {} (expires at {})", key, lease.expires_at))
            }
            // A lease already exists. It could be us, try to put it off.
            Ok(Some(_)) => self.renew_guarded(key, self.initial_ttl).await,
            Err(e) => Err(e),
        };
        drop(guard);
        outcome?;

        if self.should_collect() {
            if let Err(e) = self.prune().await {
                warn!("Failed to prune expired leases: {}", e);
            }
        }

        check_not_expired(self, key).await
    }

    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn delete(&self, key: &mut Key) -> Result<(), LockError> {
        let token = unique_token(key, NAMESPACE);

        match self.read_lease(key.resource()).await? {
            Some(existing) if existing.token == token => {}
            Some(_) => {
                debug!("Lease on {} held by another token (no-op)", key);
                return Ok(());
            }
            None => {
                debug!("Lease on {} not found for release", key);
                return Ok(());
            }
        }

        let path = self.lease_path(key.resource());
        let _guard = self.guard(&path).await?;

        // Check again under the guard, the lease may have expired and been taken over
        match self.read_lease(key.resource()).await? {
            Some(existing) if existing.token == token => {
                if let Err(e) = fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(LockError::Io(format!("Failed to delete lease: {}", e)));
                    }
                }
                debug!("Released lease on {}", key);
            }
            _ => debug!("Lease on {} was taken over before release", key),
        }

        Ok(())
    }

    async fn exists(&self, key: &mut Key) -> Result<bool, LockError> {
        let token = unique_token(key, NAMESPACE);
        Ok(self
            .read_lease(key.resource())
            .await?
            .is_some_and(|lease| lease.token == token && lease.is_live()))
    }

    #[instrument(skip(self, key), fields(resource = %key), level = "debug")]
    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> Result<(), LockError> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl(
                "LeaseStore expects a strictly positive TTL".to_string(),
            ));
        }

        self.ensure_lease_dir().await?;
        let guard = self.guard(&self.lease_path(key.resource())).await?;
        let outcome = self.renew_guarded(key, ttl).await;
        drop(guard);
        outcome?;

        check_not_expired(self, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (LeaseStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store =
            LeaseStore::with_options(temp_dir.path(), 0.0, Duration::from_secs(60)).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_validates_options() {
        let temp = TempDir::new().unwrap();

        let err = LeaseStore::with_options(temp.path(), 1.5, DEFAULT_INITIAL_TTL).unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));

        let err =
            LeaseStore::with_options(temp.path(), 0.5, Duration::from_millis(500)).unwrap_err();
        assert!(matches!(err, LockError::InvalidTtl(_)));
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (store, _temp) = setup();
        let mut first = Key::new("session-1");
        let mut second = Key::new("session-1");

        store.save(&mut first).await.unwrap();
        assert!(store.exists(&mut first).await.unwrap());
        assert!(first.expiring_time().is_some());

        // Saving again renews our own lease
        store.save(&mut first).await.unwrap();

        let err = store.save(&mut second).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(!store.exists(&mut second).await.unwrap());

        // Deleting someone else's lease is a no-op
        store.delete(&mut second).await.unwrap();
        assert!(store.exists(&mut first).await.unwrap());

        store.delete(&mut first).await.unwrap();
        assert!(!store.exists(&mut first).await.unwrap());

        store.save(&mut second).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_requires_ownership() {
        let (store, _temp) = setup();
        let mut owner = Key::new("session-1");
        let mut stranger = Key::new("session-1");

        // Nothing to renew yet
        let err = store
            .put_off_expiration(&mut owner, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        store.save(&mut owner).await.unwrap();
        store
            .put_off_expiration(&mut owner, Duration::from_secs(30))
            .await
            .unwrap();

        let err = store
            .put_off_expiration(&mut stranger, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let err = store
            .put_off_expiration(&mut owner, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidTtl(_)));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let (store, _temp) = setup();
        let mut first = Key::new("session-1");

        store.save(&mut first).await.unwrap();
        // Shorten the lease to expire almost immediately
        store
            .put_off_expiration(&mut first, Duration::from_millis(200))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!store.exists(&mut first).await.unwrap());
        assert!(first.is_expired());

        let mut second = Key::new("session-1");
        store.save(&mut second).await.unwrap();
        assert!(store.exists(&mut second).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_expired_lease_has_a_single_successor() {
        use crate::lock::Lock;
        use std::sync::Arc;
        use tokio::sync::Barrier;

        let (lease_store, _temp) = setup();
        let lease_store = Arc::new(lease_store);
        let store: Arc<dyn PersistingStore> = lease_store.clone();

        const NUM_TASKS: usize = 8;
        for round in 0..20 {
            // Every round starts from a lease left behind by a crashed holder
            let resource = format!("report-{}", round);
            let stale = LeaseFile {
                token: "crashed-holder".to_string(),
                expires_at: chrono::Utc::now().timestamp_millis() - 1_000,
            };
            lease_store.write_lease(&resource, &stale).await.unwrap();

            let barrier = Arc::new(Barrier::new(NUM_TASKS));
            let mut handles = vec![];
            for _ in 0..NUM_TASKS {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let resource = resource.clone();

                handles.push(tokio::spawn(async move {
                    let mut lock = Lock::new(
                        Key::new(resource),
                        store,
                        Some(Duration::from_secs(30)),
                        false,
                    );
                    barrier.wait().await;
                    let acquired = lock.acquire(false).await.expect("acquire failed");
                    (acquired, lock)
                }));
            }

            let mut holders = vec![];
            for handle in handles {
                let (acquired, lock) = handle.await.expect("task panicked");
                if acquired {
                    holders.push(lock);
                }
            }
            assert_eq!(holders.len(), 1, "round {}: several holders", round);
            assert!(holders[0].is_acquired().await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_delete_keeps_a_lease_taken_over() {
        let (store, _temp) = setup();
        let mut first = Key::new("session-1");
        store.save(&mut first).await.unwrap();
        store
            .put_off_expiration(&mut first, Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut second = Key::new("session-1");
        store.save(&mut second).await.unwrap();

        // The stale holder releasing late must not remove the new lease
        store.delete(&mut first).await.unwrap();
        assert!(store.exists(&mut second).await.unwrap());
        assert!(LeaseStore::guard_path(&store.lease_path("session-1")).exists());
    }

    #[tokio::test]
    async fn test_prune_removes_expired_leases() {
        let temp = TempDir::new().unwrap();
        let store = LeaseStore::with_options(temp.path(), 1.0, Duration::from_secs(60)).unwrap();

        let mut stale = Key::new("stale");
        store.save(&mut stale).await.unwrap();
        store
            .put_off_expiration(&mut stale, Duration::from_millis(200))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Saving another resource triggers collection (probability 1)
        let mut fresh = Key::new("fresh");
        store.save(&mut fresh).await.unwrap();

        assert!(!store.lease_path("stale").exists());
        assert!(store.lease_path("fresh").exists());
    }

    #[tokio::test]
    async fn test_corrupted_lease_is_discarded() {
        let (store, _temp) = setup();
        store.ensure_lease_dir().await.unwrap();
        std::fs::write(store.lease_path("session-1"), b"not json").unwrap();

        let mut key = Key::new("session-1");
        store.save(&mut key).await.unwrap();
        assert!(store.exists(&mut key).await.unwrap());
    }
}
