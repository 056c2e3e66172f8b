use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crate::acknowledger::{AckOutcome, Acknowledger};
use crate::error::MessengerError;
use crate::strategy::{BatchStrategy, CountBatchStrategy};

pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Identity of a job within one batch buffer, assigned at enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A buffered message and the acknowledger it must be settled through.
#[derive(Debug)]
pub struct BatchJob<M> {
    pub id: JobId,
    pub message: M,
    pub ack: Acknowledger,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// The message was handled right away; this is its result
    Result(Value),
    /// Number of jobs still buffered, 0 right after a flush
    Pending(usize),
}

/// A handler that accumulates messages and processes them in batches.
pub trait BatchHandler<M>: Send {
    fn name(&self) -> &str;

    /// Handle `message`.
    ///
    /// Without an acknowledger the message is processed immediately along
    /// with everything buffered, and its result returned. With one, the
    /// message is buffered and acknowledged through it once its batch runs.
    fn handle(
        &mut self,
        message: M,
        ack: Option<Acknowledger>,
    ) -> Result<HandleOutcome, MessengerError>;

    /// Process buffered jobs. `force` is set when the worker is stopping or idle.
    fn flush(&mut self, force: bool) -> Result<(), MessengerError>;

    fn pending(&self) -> usize;
}

/// Processes a batch of jobs. Every job must be acked or nacked.
pub trait BatchProcessor<M>: Send {
    fn process(&mut self, jobs: Vec<BatchJob<M>>) -> Result<(), MessengerError>;
}

/// Jobs waiting for their batch, shared by every batch handler implementation.
#[derive(Debug)]
pub struct BatchBuffer<M> {
    handler: String,
    jobs: Vec<BatchJob<M>>,
    next_id: u64,
}

impl<M> BatchBuffer<M> {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            jobs: Vec::new(),
            next_id: 0,
        }
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn enqueue(&mut self, message: M, ack: Acknowledger) -> JobId {
        let id = JobId::new(self.next_id);
        self.next_id += 1;
        self.jobs.push(BatchJob { id, message, ack });
        id
    }

    pub fn handle<P, S>(
        &mut self,
        message: M,
        ack: Option<Acknowledger>,
        processor: &mut P,
        strategy: &mut S,
    ) -> Result<HandleOutcome, MessengerError>
    where
        P: BatchProcessor<M> + ?Sized,
        S: BatchStrategy + ?Sized,
    {
        let Some(ack) = ack else {
            return self.handle_now(message, processor, strategy);
        };

        self.enqueue(message, ack);
        if !strategy.should_flush(self.jobs.len()) {
            return Ok(HandleOutcome::Pending(self.jobs.len()));
        }

        self.flush(false, processor, strategy)?;
        Ok(HandleOutcome::Pending(0))
    }

    fn handle_now<P, S>(
        &mut self,
        message: M,
        processor: &mut P,
        strategy: &mut S,
    ) -> Result<HandleOutcome, MessengerError>
    where
        P: BatchProcessor<M> + ?Sized,
        S: BatchStrategy + ?Sized,
    {
        let slot: Arc<Mutex<Option<AckOutcome>>> = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&slot);
        let ack = Acknowledger::new(self.handler.clone(), move |outcome| {
            let mut captured = captured.lock().unwrap_or_else(|e| e.into_inner());
            *captured = Some(outcome.clone());
        });

        self.enqueue(message, ack);
        self.flush(true, processor, strategy)?;

        let outcome = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        match outcome {
            Some(Ok(value)) => Ok(HandleOutcome::Result(value)),
            Some(Err(failure)) => Err(MessengerError::Handler(failure)),
            None => Err(MessengerError::NotAcknowledged(self.handler.clone())),
        }
    }

    /// Hand every buffered job to `processor`, leaving the buffer empty.
    pub fn flush<P, S>(
        &mut self,
        force: bool,
        processor: &mut P,
        strategy: &mut S,
    ) -> Result<(), MessengerError>
    where
        P: BatchProcessor<M> + ?Sized,
        S: BatchStrategy + ?Sized,
    {
        strategy.before_flush();

        let jobs = std::mem::take(&mut self.jobs);
        let outcome = if jobs.is_empty() {
            Ok(())
        } else {
            debug!(
                handler = %self.handler,
                jobs = jobs.len(),
                force,
                "Flushing batch"
            );
            processor.process(jobs)
        };

        strategy.after_flush();
        outcome
    }
}

/// A `BatchHandler` assembled from a processor and a flush strategy.
pub struct Batched<M, P, S = CountBatchStrategy> {
    buffer: BatchBuffer<M>,
    processor: P,
    strategy: S,
}

impl<M, P> Batched<M, P, CountBatchStrategy> {
    pub fn new(name: impl Into<String>, processor: P) -> Self {
        Self {
            buffer: BatchBuffer::new(name),
            processor,
            strategy: CountBatchStrategy::default(),
        }
    }
}

impl<M, P, S> Batched<M, P, S> {
    pub fn with_strategy<T: BatchStrategy>(self, strategy: T) -> Batched<M, P, T> {
        Batched {
            buffer: self.buffer,
            processor: self.processor,
            strategy,
        }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }
}

impl<M, P, S> BatchHandler<M> for Batched<M, P, S>
where
    M: Send,
    P: BatchProcessor<M>,
    S: BatchStrategy,
{
    fn name(&self) -> &str {
        self.buffer.handler()
    }

    fn handle(
        &mut self,
        message: M,
        ack: Option<Acknowledger>,
    ) -> Result<HandleOutcome, MessengerError> {
        self.buffer
            .handle(message, ack, &mut self.processor, &mut self.strategy)
    }

    fn flush(&mut self, force: bool) -> Result<(), MessengerError> {
        self.buffer.flush(force, &mut self.processor, &mut self.strategy)
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Acks every job with `message * 10` and records the batches it saw.
    #[derive(Default)]
    struct Multiply {
        batches: Vec<Vec<u32>>,
    }

    impl BatchProcessor<u32> for Multiply {
        fn process(&mut self, jobs: Vec<BatchJob<u32>>) -> Result<(), MessengerError> {
            self.batches.push(jobs.iter().map(|job| job.message).collect());
            for mut job in jobs {
                job.ack.ack(json!(job.message * 10))?;
            }
            Ok(())
        }
    }

    fn counting_ack(results: &Arc<Mutex<Vec<Value>>>) -> Acknowledger {
        let results = Arc::clone(results);
        Acknowledger::new("multiply", move |outcome| {
            if let Ok(value) = outcome {
                results.lock().unwrap().push(value.clone());
            }
        })
    }

    #[test]
    fn test_buffers_until_batch_is_full() {
        let mut handler: Batched<u32, _> = Batched::new("multiply", Multiply::default());
        let results = Arc::new(Mutex::new(Vec::new()));

        for n in 1..=9u32 {
            let outcome = handler.handle(n, Some(counting_ack(&results))).unwrap();
            assert_eq!(outcome, HandleOutcome::Pending(n as usize));
        }
        assert!(handler.processor().batches.is_empty());
        assert!(results.lock().unwrap().is_empty());

        let outcome = handler.handle(10, Some(counting_ack(&results))).unwrap();
        assert_eq!(outcome, HandleOutcome::Pending(0));
        assert_eq!(handler.pending(), 0);
        assert_eq!(handler.processor().batches, vec![(1..=10).collect::<Vec<u32>>()]);

        // Acknowledged in arrival order
        let expected: Vec<Value> = (1..=10u32).map(|n| json!(n * 10)).collect();
        assert_eq!(*results.lock().unwrap(), expected);
        assert_eq!(handler.strategy().flushes(), 1);
    }

    #[test]
    fn test_sync_handle_flushes_and_returns_result() {
        let mut handler: Batched<u32, _> = Batched::new("multiply", Multiply::default());
        let results = Arc::new(Mutex::new(Vec::new()));

        handler.handle(1, Some(counting_ack(&results))).unwrap();
        let outcome = handler.handle(7, None).unwrap();

        assert_eq!(outcome, HandleOutcome::Result(json!(70)));
        // The buffered job went out with the synchronous one
        assert_eq!(handler.processor().batches, vec![vec![1, 7]]);
        assert_eq!(*results.lock().unwrap(), vec![json!(10)]);
    }

    #[test]
    fn test_sync_handle_surfaces_nack() {
        struct Refuse;
        impl BatchProcessor<u32> for Refuse {
            fn process(&mut self, jobs: Vec<BatchJob<u32>>) -> Result<(), MessengerError> {
                for mut job in jobs {
                    job.ack.nack(anyhow::anyhow!("refused {}", job.message))?;
                }
                Ok(())
            }
        }

        let mut handler: Batched<u32, _> = Batched::new("refuse", Refuse);
        let err = handler.handle(3, None).unwrap_err();
        match err {
            MessengerError::Handler(failure) => assert_eq!(failure.to_string(), "refused 3"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_flush_drains_partial_batch() {
        let mut handler: Batched<u32, _, _> = Batched::new("multiply", Multiply::default())
            .with_strategy(CountBatchStrategy::new(3).unwrap());
        let results = Arc::new(Mutex::new(Vec::new()));

        handler.handle(1, Some(counting_ack(&results))).unwrap();
        handler.handle(2, Some(counting_ack(&results))).unwrap();
        handler.flush(false).unwrap();

        assert_eq!(handler.pending(), 0);
        assert_eq!(results.lock().unwrap().len(), 2);

        // An empty flush still runs the hooks but processes nothing
        handler.flush(true).unwrap();
        assert_eq!(handler.processor().batches.len(), 1);
        assert_eq!(handler.strategy().flushes(), 2);
    }

    #[test]
    fn test_job_ids_increase() {
        let mut buffer: BatchBuffer<&str> = BatchBuffer::new("ids");
        let first = buffer.enqueue("a", Acknowledger::detached("ids"));
        let second = buffer.enqueue("b", Acknowledger::detached("ids"));
        assert!(first < second);
        assert_eq!(second.to_string(), "#1");

        for job in &mut buffer.jobs {
            job.ack.ack(Value::Null).unwrap();
        }
    }
}
