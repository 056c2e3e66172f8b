mod combined;
mod flock;
mod lease;
mod memory;
mod strategy;
mod traits;

pub use combined::CombinedStore;
pub use flock::FlockStore;
pub use lease::LeaseStore;
pub use memory::InMemoryStore;
pub use strategy::{ConsensusStrategy, Strategy, UnanimousStrategy};
pub use traits::*;

use serde_json::Value;
use tracing::debug;

use crate::error::LockError;
use crate::key::Key;

/// Token identifying `key` within the store namespace `namespace`.
///
/// Generated on first use and kept in the key's state, so every later call
/// for the same key presents the same identity.
pub fn unique_token(key: &mut Key, namespace: &str) -> String {
    if let Some(Value::String(token)) = key.state(namespace) {
        return token.clone();
    }

    let token = uuid::Uuid::new_v4().to_string();
    key.set_state(namespace, Value::String(token.clone()));
    token
}

/// Fail with `LockError::Expired` if `key` ran out of lifetime while storing it.
///
/// The store entry is deleted on a best-effort basis first.
pub async fn check_not_expired(
    store: &(impl PersistingStore + ?Sized),
    key: &mut Key,
) -> Result<(), LockError> {
    if !key.is_expired() {
        return Ok(());
    }

    if let Err(e) = store.delete(key).await {
        debug!("Failed to delete expired lock \"{}\": {}", key, e);
    }

    Err(LockError::Expired(format!("Failed to store the \"{}\" lock.", key)))
}
