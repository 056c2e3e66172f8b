use std::fmt;

use serde_json::Value;
use tracing::error;

use crate::error::{HandlerFailure, MessengerError};

/// Final disposition of a message: the handler's value or its failure.
pub type AckOutcome = Result<Value, HandlerFailure>;

type AckCallback = Box<dyn FnOnce(&AckOutcome) + Send>;

enum AckState {
    Pending(AckCallback),
    Acknowledged(AckOutcome),
}

/// One-shot completion token for a message handed to a batch handler.
///
/// The callback runs exactly once, on the first `ack` or `nack`. An
/// acknowledger dropped without either reports `NotAcknowledged` to its
/// callback and then panics: a batch handler losing track of a message is
/// a programming error.
pub struct Acknowledger {
    handler: String,
    state: AckState,
}

impl Acknowledger {
    pub fn new<F>(handler: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce(&AckOutcome) + Send + 'static,
    {
        Self {
            handler: handler.into(),
            state: AckState::Pending(Box::new(callback)),
        }
    }

    /// An acknowledger nobody listens to.
    pub fn detached(handler: impl Into<String>) -> Self {
        Self::new(handler, |_| {})
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn ack(&mut self, result: Value) -> Result<(), MessengerError> {
        self.acknowledge(Ok(result))
    }

    pub fn nack(&mut self, error: impl Into<HandlerFailure>) -> Result<(), MessengerError> {
        self.acknowledge(Err(error.into()))
    }

    pub fn is_acknowledged(&self) -> bool {
        matches!(self.state, AckState::Acknowledged(_))
    }

    pub fn outcome(&self) -> Option<&AckOutcome> {
        match &self.state {
            AckState::Acknowledged(outcome) => Some(outcome),
            AckState::Pending(_) => None,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        self.outcome().and_then(|outcome| outcome.as_ref().ok())
    }

    pub fn error(&self) -> Option<&HandlerFailure> {
        self.outcome().and_then(|outcome| outcome.as_ref().err())
    }

    fn acknowledge(&mut self, outcome: AckOutcome) -> Result<(), MessengerError> {
        match std::mem::replace(&mut self.state, AckState::Acknowledged(outcome)) {
            AckState::Pending(callback) => {
                if let AckState::Acknowledged(outcome) = &self.state {
                    callback(outcome);
                }
                Ok(())
            }
            previous @ AckState::Acknowledged(_) => {
                // The first disposition stands
                self.state = previous;
                Err(MessengerError::AlreadyAcknowledged(self.handler.clone()))
            }
        }
    }
}

impl fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Acknowledger");
        debug.field("handler", &self.handler);
        match &self.state {
            AckState::Pending(_) => debug.field("state", &"pending"),
            AckState::Acknowledged(outcome) => debug.field("state", outcome),
        };
        debug.finish()
    }
}

impl Drop for Acknowledger {
    fn drop(&mut self) {
        let state = std::mem::replace(
            &mut self.state,
            AckState::Acknowledged(Ok(Value::Null)),
        );
        let AckState::Pending(callback) = state else {
            return;
        };

        let missing = MessengerError::NotAcknowledged(self.handler.clone());
        error!("{}", missing);
        callback(&Err(HandlerFailure::from(missing.clone())));

        if !std::thread::panicking() {
            panic!("{}", missing);
        }
    }
}
