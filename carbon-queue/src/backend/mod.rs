#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::pin::Pin;
use std::time::Duration;

use crate::{JobId, JobRecord, JobState, LeaseToken, QueueResult, QueueStats};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Storage primitives of the broker.
///
/// Every method is a single atomic step against the store. Callers other than
/// [`JobBroker`](crate::JobBroker) must not use the mutating methods.
#[async_trait]
pub trait BrokerStore: Send + Sync {
    /// Persist a new record; `waiting` records join the FIFO, `delayed` ones the schedule
    async fn enqueue(&self, record: JobRecord) -> QueueResult<()>;

    /// Claim the oldest eligible job of `queue` if fewer than `concurrency` are active.
    ///
    /// The returned record is already `active` with `attempts` incremented and a
    /// fresh lease of `lease` starting at `now`.
    async fn claim(
        &self,
        queue: &str,
        concurrency: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<JobRecord>>;

    /// Push the lease of an active job out to `until`
    async fn extend_lease(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        until: DateTime<Utc>,
    ) -> QueueResult<()>;

    /// Mark an active job completed, or drop it when it asked for removal on completion
    async fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> QueueResult<()>;

    /// Record a failed attempt; `retry_at` reschedules it as `delayed`, `None` fails it terminally
    async fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> QueueResult<()>;

    /// Active jobs of `queue` whose lease ended before `now`
    async fn expired_leases(&self, queue: &str, now: DateTime<Utc>) -> QueueResult<Vec<JobRecord>>;

    async fn get(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>>;

    async fn stats(&self, queue: &str) -> QueueResult<QueueStats>;

    /// Jobs of `queue` in `state`: waiting in FIFO order, delayed by `next_run_at`,
    /// the rest by time of their last transition (oldest first)
    async fn list(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
        offset: usize,
    ) -> QueueResult<Vec<JobRecord>>;

    /// Reset a `failed` job to `waiting` with zero attempts
    async fn retry_failed(&self, queue: &str, job_id: &JobId, now: DateTime<Utc>) -> QueueResult<JobRecord>;

    /// Remove a job that is not currently active
    async fn purge(&self, queue: &str, job_id: &JobId) -> QueueResult<JobRecord>;
}
