//! Operator view over registered queues.

#[cfg(feature = "ui")]
pub mod http;

use crate::broker::JobBroker;
use crate::{JobId, JobRecord, JobState, QueueResult, QueueStats};

/// Introspection plus the two operator actions, manual retry and purge.
///
/// Every call names its queue; an unregistered name is `UnknownQueue`.
#[derive(Clone)]
pub struct AdminApi {
    broker: JobBroker,
}

impl AdminApi {
    pub fn new(broker: JobBroker) -> Self {
        Self { broker }
    }

    pub fn list_queues(&self) -> Vec<String> {
        self.broker.registry().list_queues()
    }

    pub async fn get_queue_stats(&self, queue: &str) -> QueueResult<QueueStats> {
        self.broker.stats(queue).await
    }

    /// Terminally failed jobs, oldest failure first
    pub async fn list_failed_jobs(&self, queue: &str, limit: usize, offset: usize) -> QueueResult<Vec<JobRecord>> {
        self.broker.list(queue, JobState::Failed, limit, offset).await
    }

    pub async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
        offset: usize,
    ) -> QueueResult<Vec<JobRecord>> {
        self.broker.list(queue, state, limit, offset).await
    }

    pub async fn get_job(&self, queue: &str, job_id: &JobId) -> QueueResult<JobRecord> {
        self.broker.get(queue, job_id).await
    }

    /// Reset a `failed` job to `waiting` with zero attempts
    pub async fn retry_job(&self, queue: &str, job_id: &JobId) -> QueueResult<JobRecord> {
        self.broker.retry_job(queue, job_id).await
    }

    /// Remove a job in any state but `active`
    pub async fn purge_job(&self, queue: &str, job_id: &JobId) -> QueueResult<JobRecord> {
        self.broker.purge_job(queue, job_id).await
    }
}
