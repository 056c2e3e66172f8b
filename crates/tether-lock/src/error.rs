use thiserror::Error;

/// Errors that can occur while acquiring, refreshing or releasing a lock.
#[derive(Error, Debug)]
pub enum LockError {
    /// Someone else holds the lock. Callers may retry or back off.
    #[error("Lock conflicted: {0}")]
    Conflicted(String),

    #[error("Failed to acquire the \"{resource}\" lock: {source}")]
    Acquiring {
        resource: String,
        #[source]
        source: Box<LockError>,
    },

    #[error("Failed to release the \"{resource}\" lock: {reason}")]
    Releasing {
        resource: String,
        reason: String,
        #[source]
        source: Option<Box<LockError>>,
    },

    #[error("Lock expired: {0}")]
    Expired(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LockError {
    pub fn conflicted(resource: impl std::fmt::Display) -> Self {
        LockError::Conflicted(format!("the \"{}\" lock is held by someone else", resource))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, LockError::Conflicted(_))
    }

    /// Errors that describe the caller's request rather than a store failure.
    ///
    /// `Lock` lets these through untouched instead of wrapping them.
    pub(crate) fn passes_through(&self) -> bool {
        matches!(
            self,
            LockError::Expired(_)
                | LockError::NotSupported(_)
                | LockError::InvalidArgument(_)
                | LockError::InvalidTtl(_)
                | LockError::Acquiring { .. }
        )
    }
}
