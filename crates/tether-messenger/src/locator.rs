use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::descriptor::{HandlerDescriptor, SharedBatchHandler};
use crate::error::MessengerError;

/// Message type matching every message.
pub const CATCH_ALL: &str = "*";

/// Maps message types to the handlers registered for them.
pub struct HandlersLocator<M> {
    handlers: HashMap<String, Vec<HandlerDescriptor<M>>>,
}

impl<M> Default for HandlersLocator<M> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<M> HandlersLocator<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `descriptor` for `message_type`, or for every type with `"*"`.
    pub fn register(
        &mut self,
        message_type: impl Into<String>,
        descriptor: HandlerDescriptor<M>,
    ) -> &mut Self {
        let message_type = message_type.into();
        debug!(
            message_type = %message_type,
            handler = %descriptor.name(),
            "Registering handler"
        );
        self.handlers.entry(message_type).or_default().push(descriptor);
        self
    }

    /// Handlers for a message of `message_type`, received from `received_from` if any.
    ///
    /// Type-specific handlers come first, then catch-all ones. A handler
    /// registered several times under the same name is returned once.
    pub fn handlers(
        &self,
        message_type: &str,
        received_from: Option<&str>,
    ) -> Vec<HandlerDescriptor<M>> {
        let mut seen = HashSet::new();
        let mut matched = Vec::new();

        for key in [message_type, CATCH_ALL] {
            let Some(descriptors) = self.handlers.get(key) else {
                continue;
            };

            for descriptor in descriptors {
                if !descriptor.accepts_transport(received_from) {
                    continue;
                }
                if seen.insert(descriptor.name()) {
                    matched.push(descriptor.clone());
                }
            }
        }

        matched
    }

    /// Flush every batch handler once, e.g. when the worker goes idle or stops.
    ///
    /// All handlers are flushed even if one fails; the first failure is returned.
    pub fn flush_all(&self, force: bool) -> Result<(), MessengerError> {
        let mut flushed: Vec<&SharedBatchHandler<M>> = Vec::new();
        let mut first_error = None;

        for descriptor in self.handlers.values().flatten() {
            let Some(handler) = descriptor.batch_handler() else {
                continue;
            };
            if flushed.iter().any(|done| Arc::ptr_eq(*done, handler)) {
                continue;
            }
            flushed.push(handler);

            let outcome = match handler.lock() {
                Ok(mut handler) => handler.flush(force),
                Err(_) => Err(MessengerError::Internal(format!(
                    "Handler \"{}\" is poisoned",
                    descriptor.name()
                ))),
            };

            if let Err(e) = outcome {
                warn!(handler = %descriptor.name(), "Failed to flush batch handler: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acknowledger::Acknowledger;
    use crate::adapter::BatchHandlerAdapter;
    use crate::batch::{BatchHandler, BatchJob, HandleOutcome};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    fn named(name: &str) -> HandlerDescriptor<String> {
        HandlerDescriptor::single(name, |_: &String| Ok(Value::Null))
    }

    fn names(descriptors: &[HandlerDescriptor<String>]) -> Vec<String> {
        descriptors.iter().map(HandlerDescriptor::name).collect()
    }

    #[test]
    fn test_type_handlers_before_catch_all() {
        let mut locator = HandlersLocator::new();
        locator
            .register("*", named("audit"))
            .register("invoice.created", named("mailer"))
            .register("invoice.created", named("ledger"))
            .register("invoice.paid", named("receipt"));

        assert_eq!(
            names(&locator.handlers("invoice.created", None)),
            vec!["mailer", "ledger", "audit"]
        );
        assert_eq!(names(&locator.handlers("unknown", None)), vec!["audit"]);
    }

    #[test]
    fn test_deduplicates_by_name() {
        let mut locator = HandlersLocator::new();
        locator
            .register("invoice.created", named("audit"))
            .register("*", named("audit"))
            .register("*", named("audit").alias("copy"));

        assert_eq!(
            names(&locator.handlers("invoice.created", None)),
            vec!["audit", "audit@copy"]
        );
    }

    #[test]
    fn test_filters_by_transport() {
        let mut locator = HandlersLocator::new();
        locator
            .register("invoice.created", named("mailer").from_transport("async"))
            .register("invoice.created", named("ledger"));

        assert_eq!(
            names(&locator.handlers("invoice.created", Some("async"))),
            vec!["mailer", "ledger"]
        );
        assert_eq!(
            names(&locator.handlers("invoice.created", Some("failed"))),
            vec!["ledger"]
        );
        assert_eq!(
            names(&locator.handlers("invoice.created", None)),
            vec!["mailer", "ledger"]
        );
    }

    #[test]
    fn test_flush_all_flushes_each_batch_handler_once() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let adapter = BatchHandlerAdapter::new("collect", move |jobs: Vec<BatchJob<String>>| {
            sink.lock().unwrap().push(jobs.len());
            for mut job in jobs {
                job.ack.ack(json!(true))?;
            }
            Ok(())
        });
        let shared: SharedBatchHandler<String> = Arc::new(Mutex::new(adapter));

        let mut locator = HandlersLocator::new();
        locator
            .register("invoice.created", HandlerDescriptor::shared_batch("collect", Arc::clone(&shared)))
            .register("invoice.paid", HandlerDescriptor::shared_batch("collect", Arc::clone(&shared)))
            .register("*", named("audit"));

        for descriptor in locator.handlers("invoice.created", None) {
            let outcome = descriptor
                .call("a".to_string(), Some(Acknowledger::detached("collect")))
                .unwrap();
            if descriptor.name() == "collect" {
                assert_eq!(outcome, HandleOutcome::Pending(1));
            }
        }
        assert_eq!(shared.lock().unwrap().pending(), 1);

        locator.flush_all(true).unwrap();
        assert_eq!(*batches.lock().unwrap(), vec![1]);
        assert_eq!(shared.lock().unwrap().pending(), 0);
    }
}
