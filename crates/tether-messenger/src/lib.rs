//! Batched message handling with explicit per-message acknowledgement.
//!
//! Batch handlers buffer messages and acknowledge each of them through an
//! [`Acknowledger`] once their batch has been processed. Messages handled
//! without an acknowledger are processed right away.

pub mod acknowledger;
pub mod adapter;
pub mod batch;
pub mod descriptor;
pub mod error;
pub mod locator;
pub mod result;
pub mod strategy;

pub use acknowledger::{AckOutcome, Acknowledger};
pub use adapter::BatchHandlerAdapter;
pub use batch::{
    BatchBuffer, BatchHandler, BatchJob, BatchProcessor, Batched, HandleOutcome, JobId,
    DEFAULT_BATCH_SIZE,
};
pub use descriptor::{
    HandlerDescriptor, HandlerKind, HandlerOptions, SharedBatchHandler, SingleHandler,
};
pub use error::{HandlerFailure, MessengerError};
pub use locator::{HandlersLocator, CATCH_ALL};
pub use result::{BatchResult, ResultWrappedHandler};
pub use strategy::{BatchStrategy, CountBatchStrategy};
