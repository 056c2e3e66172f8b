use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised while dispatching messages to handlers and acknowledging them.
#[derive(Error, Debug, Clone)]
pub enum MessengerError {
    #[error("The acknowledger cannot be called twice by the \"{0}\" batch handler.")]
    AlreadyAcknowledged(String),

    #[error("The acknowledger was not called by the \"{0}\" batch handler.")]
    NotAcknowledged(String),

    #[error("Job {0} is not part of this batch.")]
    UnknownJob(String),

    #[error("Handler failed: {0}")]
    Handler(HandlerFailure),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// A handler error shared by every acknowledger it is delivered to.
#[derive(Clone)]
pub struct HandlerFailure(Arc<anyhow::Error>);

impl HandlerFailure {
    pub fn msg<D>(message: D) -> Self
    where
        D: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// The `MessengerError` carried by this failure, if it wraps one.
    pub fn as_messenger_error(&self) -> Option<&MessengerError> {
        self.0.downcast_ref::<MessengerError>()
    }
}

impl From<anyhow::Error> for HandlerFailure {
    fn from(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

impl From<MessengerError> for HandlerFailure {
    fn from(error: MessengerError) -> Self {
        Self(Arc::new(anyhow::Error::new(error)))
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for HandlerFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}
