use crate::batch::DEFAULT_BATCH_SIZE;
use crate::error::MessengerError;

/// Decides when a batch handler flushes its buffered jobs.
pub trait BatchStrategy: Send {
    /// Called after every enqueue with the number of buffered jobs.
    fn should_flush(&self, pending: usize) -> bool;

    fn before_flush(&mut self) {}

    fn after_flush(&mut self) {}
}

impl<S: BatchStrategy + ?Sized> BatchStrategy for Box<S> {
    fn should_flush(&self, pending: usize) -> bool {
        (**self).should_flush(pending)
    }

    fn before_flush(&mut self) {
        (**self).before_flush()
    }

    fn after_flush(&mut self) {
        (**self).after_flush()
    }
}

/// Flush once a fixed number of jobs is buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountBatchStrategy {
    size: usize,
    flushes: usize,
}

impl CountBatchStrategy {
    pub fn new(size: usize) -> Result<Self, MessengerError> {
        if size == 0 {
            return Err(MessengerError::InvalidArgument(
                "The batch size must be greater than zero.".to_string(),
            ));
        }
        Ok(Self { size, flushes: 0 })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of flushes performed so far, forced ones included.
    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl Default for CountBatchStrategy {
    fn default() -> Self {
        Self {
            size: DEFAULT_BATCH_SIZE,
            flushes: 0,
        }
    }
}

impl BatchStrategy for CountBatchStrategy {
    fn should_flush(&self, pending: usize) -> bool {
        pending >= self.size
    }

    fn after_flush(&mut self) {
        self.flushes += 1;
    }
}
