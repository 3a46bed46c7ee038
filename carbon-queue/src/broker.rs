use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

use crate::backend::BrokerStore;
use crate::job::{QueueRegistry, RegisteredQueue};
use crate::observability::EventBus;
use crate::types::after;
use crate::{
    ClaimedJob, JobError, JobEvent, JobId, JobOptions, JobRecord, JobState, QueueError,
    QueueResult, QueueStats,
};

const DEFAULT_JOB_NAME: &str = "default";
const LEASE_EXPIRED: &str = "lease expired: job timed out or its worker died without reporting";
const TRANSITION_SHARDS: usize = 64;

/// Sharded per-job locks held across a store transition and its event
struct TransitionLocks {
    shards: Box<[Mutex<()>]>,
}

impl TransitionLocks {
    fn new() -> Self {
        Self {
            shards: (0..TRANSITION_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, job_id: &JobId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        job_id.hash(&mut hasher);
        let shard = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards[shard].lock().await
    }
}

/// When a failed attempt runs next, or `None` when the job fails terminally.
///
/// Terminal errors and exhausted attempts never reschedule. A retry is never
/// scheduled before the job's current `next_run_at`.
pub fn next_attempt_at(record: &JobRecord, error: &JobError, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !error.is_retryable() || !record.attempts_remaining() {
        return None;
    }
    let delay = record.retry.delay_for(record.attempts);
    Some(after(now, delay).max(record.next_run_at))
}

/// The only writer of job state.
///
/// Every transition is one atomic store call followed by the matching
/// lifecycle event. Both happen under the job's transition lock, and a claim
/// takes that lock before announcing `Active`, so events of one job come out
/// in transition order even when many slots race on it.
#[derive(Clone)]
pub struct JobBroker {
    store: Arc<dyn BrokerStore>,
    registry: Arc<QueueRegistry>,
    events: EventBus,
    lease_duration: Duration,
    transitions: Arc<TransitionLocks>,
}

impl JobBroker {
    pub fn new(
        store: Arc<dyn BrokerStore>,
        registry: Arc<QueueRegistry>,
        events: EventBus,
        lease_duration: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            lease_duration,
            transitions: Arc::new(TransitionLocks::new()),
        }
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    fn queue(&self, name: &str) -> QueueResult<&Arc<RegisteredQueue>> {
        self.registry.get(name)
    }

    /// Add a job to `queue`; it is `waiting`, or `delayed` when the options carry a delay
    #[instrument(skip(self, payload, options))]
    pub async fn enqueue(&self, queue: &str, payload: Vec<u8>, options: JobOptions) -> QueueResult<JobId> {
        let registered = self.queue(queue)?;
        let queue_options = registered.options();
        let retry = options.resolve_retry(&queue_options.retry)?;

        let timeout = options.timeout.or(queue_options.timeout);
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(QueueError::config("job timeout must be non-zero"));
        }

        let now = Utc::now();
        let run_at = options.delay.map_or(now, |delay| after(now, delay));
        let name = options.name.unwrap_or_else(|| DEFAULT_JOB_NAME.to_string());

        let mut record = JobRecord::new(queue, name, payload, retry, run_at, now);
        record.remove_on_complete = options
            .remove_on_complete
            .unwrap_or(queue_options.remove_on_complete);
        record.timeout = timeout;

        let job_id = record.id.clone();
        let state = record.state;
        let (name, next_run_at) = (record.name.clone(), record.next_run_at);

        let _transition = self.transitions.lock(&job_id).await;
        self.store.enqueue(record).await?;

        if state == JobState::Waiting {
            self.events.emit(JobEvent::Waiting {
                job_id: job_id.clone(),
                queue: queue.to_string(),
                name,
                at: now,
            });
        } else {
            debug!(%job_id, %next_run_at, "Job delayed");
        }
        Ok(job_id)
    }

    /// Enqueue a JSON-serialised payload
    pub async fn enqueue_json<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        options: JobOptions,
    ) -> QueueResult<JobId> {
        let bytes = serde_json::to_vec(payload)?;
        self.enqueue(queue, bytes, options).await
    }

    /// Claim the oldest eligible job of `queue` if its concurrency allows; never blocks
    pub async fn claim(&self, queue: &str) -> QueueResult<Option<ClaimedJob>> {
        let registered = self.queue(queue)?;
        let now = Utc::now();
        let Some(record) = self
            .store
            .claim(queue, registered.concurrency(), self.lease_duration, now)
            .await?
        else {
            return Ok(None);
        };

        let claimed = ClaimedJob::from_active(record)?;
        // Wait out the emit of whichever transition made the job eligible
        let _transition = self.transitions.lock(claimed.id()).await;
        self.events.emit(JobEvent::Active {
            job_id: claimed.id().clone(),
            queue: queue.to_string(),
            attempt: claimed.attempt(),
            lease_until: claimed.lease_expires_at,
            at: now,
        });
        Ok(Some(claimed))
    }

    /// Renew the lease of a running job for another lease duration
    pub async fn extend_lease(&self, job: &ClaimedJob) -> QueueResult<DateTime<Utc>> {
        let until = after(Utc::now(), self.lease_duration);
        self.store
            .extend_lease(job.queue(), job.id(), &job.lease_token, until)
            .await?;
        Ok(until)
    }

    pub async fn complete(&self, job: &ClaimedJob) -> QueueResult<()> {
        let _transition = self.transitions.lock(job.id()).await;
        let now = Utc::now();
        self.store
            .complete(job.queue(), job.id(), &job.lease_token, now)
            .await?;
        self.events.emit(JobEvent::Completed {
            job_id: job.id().clone(),
            queue: job.queue().to_string(),
            attempt: job.attempt(),
            at: now,
        });
        Ok(())
    }

    /// Report a failed attempt; returns the retry time, or `None` when the job is now `failed`
    pub async fn fail(&self, job: &ClaimedJob, error: &JobError) -> QueueResult<Option<DateTime<Utc>>> {
        let _transition = self.transitions.lock(job.id()).await;
        let now = Utc::now();
        let retry_at = next_attempt_at(&job.record, error, now);
        self.store
            .fail(job.queue(), job.id(), &job.lease_token, error.message(), retry_at, now)
            .await?;
        self.events.emit(JobEvent::Failed {
            job_id: job.id().clone(),
            queue: job.queue().to_string(),
            attempt: job.attempt(),
            error: error.message().to_string(),
            retry_at,
            at: now,
        });
        Ok(retry_at)
    }

    /// Fail every active job of `queue` whose lease has expired, as a retryable failure
    pub async fn reap_stalled(&self, queue: &str) -> QueueResult<usize> {
        self.queue(queue)?;
        let now = Utc::now();
        let expired = self.store.expired_leases(queue, now).await?;

        let mut reaped = 0;
        for record in expired {
            let job = match ClaimedJob::from_active(record) {
                Ok(job) => job,
                Err(e) => {
                    warn!(queue, error = %e, "Skipping unleased active job");
                    continue;
                }
            };
            let error = JobError::retryable(LEASE_EXPIRED);
            let _transition = self.transitions.lock(job.id()).await;
            let retry_at = next_attempt_at(&job.record, &error, now);

            match self
                .store
                .fail(queue, job.id(), &job.lease_token, error.message(), retry_at, now)
                .await
            {
                Ok(()) => {}
                // Reported or renewed between the scan and now
                Err(e) if e.is_claim_lost() => continue,
                Err(e) => return Err(e),
            }

            reaped += 1;
            self.events.emit(JobEvent::Stalled {
                job_id: job.id().clone(),
                queue: queue.to_string(),
                attempt: job.attempt(),
                at: now,
            });
            self.events.emit(JobEvent::Failed {
                job_id: job.id().clone(),
                queue: queue.to_string(),
                attempt: job.attempt(),
                error: error.message().to_string(),
                retry_at,
                at: now,
            });
        }
        Ok(reaped)
    }

    /// Operator retry: a `failed` job goes back to `waiting` with zero attempts
    #[instrument(skip(self))]
    pub async fn retry_job(&self, queue: &str, job_id: &JobId) -> QueueResult<JobRecord> {
        self.queue(queue)?;
        let _transition = self.transitions.lock(job_id).await;
        let now = Utc::now();
        let record = self.store.retry_failed(queue, job_id, now).await?;
        self.events.emit(JobEvent::Waiting {
            job_id: record.id.clone(),
            queue: queue.to_string(),
            name: record.name.clone(),
            at: now,
        });
        Ok(record)
    }

    /// Remove a job that is not active
    #[instrument(skip(self))]
    pub async fn purge_job(&self, queue: &str, job_id: &JobId) -> QueueResult<JobRecord> {
        self.queue(queue)?;
        let record = self.store.purge(queue, job_id).await?;
        debug!(state = %record.state, "Job purged");
        Ok(record)
    }

    pub async fn get(&self, queue: &str, job_id: &JobId) -> QueueResult<JobRecord> {
        self.queue(queue)?;
        self.store
            .get(queue, job_id)
            .await?
            .ok_or_else(|| QueueError::not_found(queue, job_id))
    }

    pub async fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        self.queue(queue)?;
        self.store.stats(queue).await
    }

    pub async fn list(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
        offset: usize,
    ) -> QueueResult<Vec<JobRecord>> {
        self.queue(queue)?;
        self.store.list(queue, state, limit, offset).await
    }
}
