use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::acknowledger::Acknowledger;
use crate::batch::{BatchHandler, HandleOutcome};
use crate::error::{HandlerFailure, MessengerError};

pub type SingleHandler<M> = Arc<Mutex<dyn FnMut(&M) -> anyhow::Result<Value> + Send>>;
pub type SharedBatchHandler<M> = Arc<Mutex<dyn BatchHandler<M>>>;

pub enum HandlerKind<M> {
    Single(SingleHandler<M>),
    Batch(SharedBatchHandler<M>),
}

impl<M> Clone for HandlerKind<M> {
    fn clone(&self) -> Self {
        match self {
            HandlerKind::Single(handler) => HandlerKind::Single(Arc::clone(handler)),
            HandlerKind::Batch(handler) => HandlerKind::Batch(Arc::clone(handler)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerOptions {
    /// Only handle messages received from this transport
    pub from_transport: Option<String>,
    /// Distinguishes several registrations of the same handler
    pub alias: Option<String>,
}

/// A handler registered for a message type, with its routing options.
pub struct HandlerDescriptor<M> {
    name: String,
    kind: HandlerKind<M>,
    options: HandlerOptions,
}

impl<M> Clone for HandlerDescriptor<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind.clone(),
            options: self.options.clone(),
        }
    }
}

impl<M> fmt::Debug for HandlerDescriptor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            HandlerKind::Single(_) => "single",
            HandlerKind::Batch(_) => "batch",
        };
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name())
            .field("kind", &kind)
            .field("options", &self.options)
            .finish()
    }
}

impl<M: 'static> HandlerDescriptor<M> {
    pub fn single<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(&M) -> anyhow::Result<Value> + Send + 'static,
    {
        let handler: SingleHandler<M> = Arc::new(Mutex::new(handler));
        Self {
            name: name.into(),
            kind: HandlerKind::Single(handler),
            options: HandlerOptions::default(),
        }
    }

    /// Register a batch handler under its own name.
    pub fn batch(handler: impl BatchHandler<M> + 'static) -> Self {
        let name = handler.name().to_string();
        let handler: SharedBatchHandler<M> = Arc::new(Mutex::new(handler));
        Self::shared_batch(name, handler)
    }

    /// Register a batch handler that is also registered elsewhere.
    pub fn shared_batch(name: impl Into<String>, handler: SharedBatchHandler<M>) -> Self {
        Self {
            name: name.into(),
            kind: HandlerKind::Batch(handler),
            options: HandlerOptions::default(),
        }
    }
}

impl<M> HandlerDescriptor<M> {
    pub fn with_options(mut self, options: HandlerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn from_transport(mut self, transport: impl Into<String>) -> Self {
        self.options.from_transport = Some(transport.into());
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.options.alias = Some(alias.into());
        self
    }

    pub fn name(&self) -> String {
        match &self.options.alias {
            Some(alias) => format!("{}@{}", self.name, alias),
            None => self.name.clone(),
        }
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    pub fn kind(&self) -> &HandlerKind<M> {
        &self.kind
    }

    pub fn batch_handler(&self) -> Option<&SharedBatchHandler<M>> {
        match &self.kind {
            HandlerKind::Batch(handler) => Some(handler),
            HandlerKind::Single(_) => None,
        }
    }

    /// Whether this handler applies to a message received from `transport`.
    pub fn accepts_transport(&self, transport: Option<&str>) -> bool {
        match (&self.options.from_transport, transport) {
            (Some(expected), Some(received)) => expected == received,
            _ => true,
        }
    }

    /// Hand `message` to the handler.
    ///
    /// A single handler runs right away and settles `ack` when one is given.
    /// A batch handler decides itself when the message is processed.
    pub fn call(
        &self,
        message: M,
        ack: Option<Acknowledger>,
    ) -> Result<HandleOutcome, MessengerError> {
        match &self.kind {
            HandlerKind::Single(handler) => {
                let outcome = {
                    let mut handler = handler.lock().map_err(|_| {
                        MessengerError::Internal(format!("Handler \"{}\" is poisoned", self.name()))
                    })?;
                    (&mut *handler)(&message)
                };
                settle(outcome, ack)
            }
            HandlerKind::Batch(handler) => {
                let mut handler = handler.lock().map_err(|_| {
                    MessengerError::Internal(format!("Handler \"{}\" is poisoned", self.name()))
                })?;
                handler.handle(message, ack)
            }
        }
    }
}

fn settle(
    outcome: anyhow::Result<Value>,
    ack: Option<Acknowledger>,
) -> Result<HandleOutcome, MessengerError> {
    match outcome {
        Ok(value) => {
            if let Some(mut ack) = ack {
                ack.ack(value.clone())?;
            }
            Ok(HandleOutcome::Result(value))
        }
        Err(e) => {
            let failure = HandlerFailure::from(e);
            if let Some(mut ack) = ack {
                ack.nack(failure.clone())?;
            }
            Err(MessengerError::Handler(failure))
        }
    }
}
