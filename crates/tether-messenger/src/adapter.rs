use crate::acknowledger::Acknowledger;
use crate::batch::{BatchHandler, BatchJob, BatchProcessor, Batched, HandleOutcome};
use crate::error::MessengerError;
use crate::strategy::{BatchStrategy, CountBatchStrategy};

type ProcessFn<M> = Box<dyn FnMut(Vec<BatchJob<M>>) -> Result<(), MessengerError> + Send>;

struct ClosureProcessor<M>(ProcessFn<M>);

impl<M> BatchProcessor<M> for ClosureProcessor<M> {
    fn process(&mut self, jobs: Vec<BatchJob<M>>) -> Result<(), MessengerError> {
        (self.0)(jobs)
    }
}

/// Batch handler backed by a closure receiving whole batches.
pub struct BatchHandlerAdapter<M> {
    inner: Batched<M, ClosureProcessor<M>, Box<dyn BatchStrategy>>,
}

impl<M: 'static> BatchHandlerAdapter<M> {
    pub fn new<F>(name: impl Into<String>, process: F) -> Self
    where
        F: FnMut(Vec<BatchJob<M>>) -> Result<(), MessengerError> + Send + 'static,
    {
        let strategy: Box<dyn BatchStrategy> = Box::new(CountBatchStrategy::default());
        Self {
            inner: Batched::new(name, ClosureProcessor(Box::new(process))).with_strategy(strategy),
        }
    }

    pub fn with_strategy(self, strategy: impl BatchStrategy + 'static) -> Self {
        let strategy: Box<dyn BatchStrategy> = Box::new(strategy);
        Self {
            inner: self.inner.with_strategy(strategy),
        }
    }

    pub fn with_batch_size(self, size: usize) -> Result<Self, MessengerError> {
        Ok(self.with_strategy(CountBatchStrategy::new(size)?))
    }
}

impl<M: Send> BatchHandler<M> for BatchHandlerAdapter<M> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn handle(
        &mut self,
        message: M,
        ack: Option<Acknowledger>,
    ) -> Result<HandleOutcome, MessengerError> {
        self.inner.handle(message, ack)
    }

    fn flush(&mut self, force: bool) -> Result<(), MessengerError> {
        self.inner.flush(force)
    }

    fn pending(&self) -> usize {
        self.inner.pending()
    }
}
