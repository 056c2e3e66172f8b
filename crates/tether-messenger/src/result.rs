use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::acknowledger::Acknowledger;
use crate::batch::{BatchJob, BatchProcessor, JobId};
use crate::error::{HandlerFailure, MessengerError};

/// Per-job outcomes of one batch, reported by job id.
#[derive(Debug)]
pub struct BatchResult {
    acks: BTreeMap<JobId, Acknowledger>,
}

impl BatchResult {
    /// Split `jobs` into their messages and the acknowledgers to report to.
    pub fn from_jobs<M>(jobs: Vec<BatchJob<M>>) -> (Vec<(JobId, M)>, Self) {
        let mut acks = BTreeMap::new();
        let messages = jobs
            .into_iter()
            .map(|job| {
                acks.insert(job.id, job.ack);
                (job.id, job.message)
            })
            .collect();

        (messages, Self { acks })
    }

    pub fn ok(&mut self, id: JobId, value: Value) -> Result<(), MessengerError> {
        self.ack_for(id)?.ack(value)
    }

    pub fn error(
        &mut self,
        id: JobId,
        failure: impl Into<HandlerFailure>,
    ) -> Result<(), MessengerError> {
        self.ack_for(id)?.nack(failure)
    }

    /// Jobs not reported yet, in arrival order.
    pub fn pending(&self) -> Vec<JobId> {
        self.acks
            .iter()
            .filter(|(_, ack)| !ack.is_acknowledged())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    /// Nack every job not reported yet. Returns how many were nacked.
    pub fn nack_pending(&mut self, failure: HandlerFailure) -> usize {
        let mut nacked = 0;
        for ack in self.acks.values_mut() {
            if !ack.is_acknowledged() && ack.nack(failure.clone()).is_ok() {
                nacked += 1;
            }
        }
        nacked
    }

    fn ack_for(&mut self, id: JobId) -> Result<&mut Acknowledger, MessengerError> {
        self.acks
            .get_mut(&id)
            .ok_or_else(|| MessengerError::UnknownJob(id.to_string()))
    }
}

/// Batch processor driven by a closure that reports results per job.
///
/// The closure gets the messages of the batch and a `BatchResult` to report
/// to. A closure error nacks every job it did not report; jobs left
/// unreported after a successful run are nacked as not acknowledged.
pub struct ResultWrappedHandler<F> {
    name: String,
    handler: F,
}

impl<F> ResultWrappedHandler<F> {
    pub fn new<M>(name: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(Vec<(JobId, M)>, &mut BatchResult) -> anyhow::Result<()> + Send,
    {
        Self {
            name: name.into(),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<M, F> BatchProcessor<M> for ResultWrappedHandler<F>
where
    F: FnMut(Vec<(JobId, M)>, &mut BatchResult) -> anyhow::Result<()> + Send,
{
    fn process(&mut self, jobs: Vec<BatchJob<M>>) -> Result<(), MessengerError> {
        let (messages, mut results) = BatchResult::from_jobs(jobs);

        if let Err(e) = (self.handler)(messages, &mut results) {
            let failure = HandlerFailure::from(e);
            let nacked = results.nack_pending(failure.clone());
            warn!(
                handler = %self.name,
                nacked,
                "Batch failed: {}",
                failure
            );
            return Ok(());
        }

        let missing = results.pending();
        if missing.is_empty() {
            return Ok(());
        }

        let error = MessengerError::NotAcknowledged(self.name.clone());
        warn!(
            handler = %self.name,
            missing = missing.len(),
            "Batch finished without reporting every job"
        );
        results.nack_pending(HandlerFailure::from(error.clone()));
        Err(error)
    }
}
