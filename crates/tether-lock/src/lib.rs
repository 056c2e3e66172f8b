//! TTL-bounded locks over pluggable stores.
//!
//! A [`Lock`] is created for one resource (usually through a
//! [`LockFactory`]) and arbitrated by a [`PersistingStore`]. Stores may
//! additionally support blocking and shared locks; see the `store` module.

pub mod config;
pub mod error;
pub mod factory;
pub mod key;
pub mod lock;
pub mod scoped;
pub mod store;

pub use config::{LockConfig, RetryPolicy, DEFAULT_TTL_SECS};
pub use error::LockError;
pub use factory::LockFactory;
pub use key::Key;
pub use lock::Lock;
pub use scoped::ScopedLock;
pub use store::{
    require_blocking, BlockingSharedLockStore, BlockingStore, CombinedStore, ConsensusStrategy,
    FlockStore, InMemoryStore, LeaseStore, PersistingStore, SharedLockStore, Strategy,
    UnanimousStrategy,
};
