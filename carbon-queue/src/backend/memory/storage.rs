use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{
    backend::BrokerStore, types::after, JobId, JobRecord, JobState, LeaseToken, QueueError,
    QueueResult, QueueStats,
};

/// Per-queue structures; job records themselves live in [`MemoryState::jobs`]
#[derive(Default)]
struct QueueLists {
    /// FIFO of waiting job ids
    waiting: VecDeque<JobId>,
    /// Delayed job ids ordered by `next_run_at`
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    /// Index of active job ids, for the concurrency check and the reaper
    active: HashSet<JobId>,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, JobRecord>,
    queues: HashMap<String, QueueLists>,
}

/// In-memory broker store for tests, development and single-process deployments.
///
/// All state sits behind one lock, so every trait method is linearizable.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    /// Cleared to simulate an unreachable store
    available: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle reachability; while unavailable every call fails with `BrokerUnavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Force a lease to expire (test helper)
    pub fn force_lease_expiry(&self, job_id: &JobId) {
        let mut state = self.state.write();
        if let Some(record) = state.jobs.get_mut(job_id) {
            if record.state == JobState::Active {
                record.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
            }
        }
    }

    /// Total number of stored records across all queues
    pub fn len(&self) -> usize {
        self.state.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> QueueResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::BrokerUnavailable("memory store marked unavailable".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn owned_record<'a>(
    jobs: &'a mut HashMap<JobId, JobRecord>,
    queue: &str,
    job_id: &JobId,
) -> QueueResult<&'a mut JobRecord> {
    jobs.get_mut(job_id)
        .filter(|record| record.queue == queue)
        .ok_or_else(|| QueueError::not_found(queue, job_id))
}

fn leased_record<'a>(
    jobs: &'a mut HashMap<JobId, JobRecord>,
    queue: &str,
    job_id: &JobId,
    token: &LeaseToken,
) -> QueueResult<&'a mut JobRecord> {
    let record = owned_record(jobs, queue, job_id)?;
    if !record.holds_lease(token) {
        return Err(QueueError::InvalidLeaseToken(job_id.to_string()));
    }
    Ok(record)
}

#[async_trait]
impl BrokerStore for MemoryStore {
    async fn enqueue(&self, record: JobRecord) -> QueueResult<()> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let MemoryState { jobs, queues } = &mut *state;
        let lists = queues.entry(record.queue.clone()).or_default();

        match record.state {
            JobState::Waiting => lists.waiting.push_back(record.id.clone()),
            JobState::Delayed => {
                lists.delayed.insert((record.next_run_at, record.id.clone()));
            }
            other => {
                return Err(QueueError::InvalidState {
                    job_id: record.id.to_string(),
                    state: other,
                    expected: "waiting or delayed",
                })
            }
        }
        jobs.insert(record.id.clone(), record);
        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        concurrency: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<JobRecord>> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let MemoryState { jobs, queues } = &mut *state;
        let Some(lists) = queues.get_mut(queue) else {
            return Ok(None);
        };
        if lists.active.len() >= concurrency {
            return Ok(None);
        }

        // Oldest eligible job: the FIFO head or the earliest due delayed job
        let head_at = lists
            .waiting
            .front()
            .and_then(|id| jobs.get(id))
            .map(|record| record.next_run_at);
        let due = lists
            .delayed
            .iter()
            .next()
            .filter(|(at, _)| *at <= now)
            .cloned();
        let take_delayed = match (head_at, &due) {
            (Some(head_at), Some((due_at, _))) => *due_at < head_at,
            (None, Some(_)) => true,
            _ => false,
        };

        let job_id = match due {
            Some(entry) if take_delayed => {
                lists.delayed.remove(&entry);
                entry.1
            }
            _ => match lists.waiting.pop_front() {
                Some(id) => id,
                None => return Ok(None),
            },
        };

        let record = jobs
            .get_mut(&job_id)
            .ok_or_else(|| QueueError::Internal(format!("queued id {job_id} has no record")))?;
        record.mark_active(LeaseToken::new(), after(now, lease), now);
        lists.active.insert(job_id);

        Ok(Some(record.clone()))
    }

    async fn extend_lease(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        until: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let record = leased_record(&mut state.jobs, queue, job_id, token)?;
        if record.lease_expires_at.map_or(true, |current| current < until) {
            record.lease_expires_at = Some(until);
        }
        Ok(())
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let MemoryState { jobs, queues } = &mut *state;

        let record = leased_record(jobs, queue, job_id, token)?;
        record.mark_completed(now);
        let remove = record.remove_on_complete;

        if let Some(lists) = queues.get_mut(queue) {
            lists.active.remove(job_id);
        }
        if remove {
            jobs.remove(job_id);
        }
        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let MemoryState { jobs, queues } = &mut *state;

        let record = leased_record(jobs, queue, job_id, token)?;
        record.mark_failed(error.to_string(), retry_at, now);

        let lists = queues.entry(queue.to_string()).or_default();
        lists.active.remove(job_id);
        if record.state == JobState::Delayed {
            lists.delayed.insert((record.next_run_at, job_id.clone()));
        }
        Ok(())
    }

    async fn expired_leases(&self, queue: &str, now: DateTime<Utc>) -> QueueResult<Vec<JobRecord>> {
        self.ensure_available()?;
        let state = self.state.read();
        let Some(lists) = state.queues.get(queue) else {
            return Ok(Vec::new());
        };

        let mut expired: Vec<JobRecord> = lists
            .active
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|record| record.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|record| record.lease_expires_at);
        Ok(expired)
    }

    async fn get(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        self.ensure_available()?;
        let state = self.state.read();
        Ok(state
            .jobs
            .get(job_id)
            .filter(|record| record.queue == queue)
            .cloned())
    }

    async fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        self.ensure_available()?;
        let state = self.state.read();
        let mut stats = QueueStats::default();
        for record in state.jobs.values().filter(|record| record.queue == queue) {
            stats.bump(record.state);
        }
        Ok(stats)
    }

    async fn list(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
        offset: usize,
    ) -> QueueResult<Vec<JobRecord>> {
        self.ensure_available()?;
        let guard = self.state.read();
        let jobs = &guard.jobs;
        let lookup = |id: &JobId| jobs.get(id).cloned();

        let records: Vec<JobRecord> = match (state, guard.queues.get(queue)) {
            (_, None) => Vec::new(),
            (JobState::Waiting, Some(lists)) => lists.waiting.iter().filter_map(lookup).collect(),
            (JobState::Delayed, Some(lists)) => {
                lists.delayed.iter().filter_map(|(_, id)| lookup(id)).collect()
            }
            (_, Some(_)) => {
                let mut matching: Vec<JobRecord> = jobs
                    .values()
                    .filter(|record| record.queue == queue && record.state == state)
                    .cloned()
                    .collect();
                matching.sort_by(|a, b| {
                    (a.updated_at, a.created_at, &a.id).cmp(&(b.updated_at, b.created_at, &b.id))
                });
                matching
            }
        };

        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn retry_failed(&self, queue: &str, job_id: &JobId, now: DateTime<Utc>) -> QueueResult<JobRecord> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let MemoryState { jobs, queues } = &mut *state;

        let record = owned_record(jobs, queue, job_id)?;
        if record.state != JobState::Failed {
            return Err(QueueError::InvalidState {
                job_id: job_id.to_string(),
                state: record.state,
                expected: "failed",
            });
        }
        record.reset_for_retry(now);
        queues
            .entry(queue.to_string())
            .or_default()
            .waiting
            .push_back(job_id.clone());
        Ok(record.clone())
    }

    async fn purge(&self, queue: &str, job_id: &JobId) -> QueueResult<JobRecord> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let MemoryState { jobs, queues } = &mut *state;

        let record = owned_record(jobs, queue, job_id)?;
        if record.state == JobState::Active {
            return Err(QueueError::InvalidState {
                job_id: job_id.to_string(),
                state: JobState::Active,
                expected: "not active",
            });
        }

        if let Some(lists) = queues.get_mut(queue) {
            match record.state {
                JobState::Waiting => lists.waiting.retain(|id| id != job_id),
                JobState::Delayed => {
                    lists.delayed.remove(&(record.next_run_at, job_id.clone()));
                }
                _ => {}
            }
        }
        jobs.remove(job_id)
            .ok_or_else(|| QueueError::not_found(queue, job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetryPolicy;

    fn waiting(queue: &str, now: DateTime<Utc>) -> JobRecord {
        JobRecord::new(queue, queue, b"{}".to_vec(), RetryPolicy::default(), now, now)
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn claim_respects_concurrency() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for _ in 0..3 {
            store.enqueue(waiting("pdf-generation", now)).await.unwrap();
        }

        let first = store.claim("pdf-generation", 2, LEASE, now).await.unwrap();
        let second = store.claim("pdf-generation", 2, LEASE, now).await.unwrap();
        let third = store.claim("pdf-generation", 2, LEASE, now).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_some());
        assert!(third.is_none());
        assert_eq!(store.stats("pdf-generation").await.unwrap().active, 2);
    }

    #[tokio::test]
    async fn claim_prefers_older_due_delayed_job() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let mut retried = waiting("email", t0);
        retried.state = JobState::Delayed;
        retried.next_run_at = t0 + chrono::Duration::milliseconds(10);
        let retried_id = retried.id.clone();
        store.enqueue(retried).await.unwrap();

        let fresh = waiting("email", t0 + chrono::Duration::milliseconds(20));
        store.enqueue(fresh).await.unwrap();

        let now = t0 + chrono::Duration::milliseconds(30);
        let claimed = store.claim("email", 5, LEASE, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, retried_id);
        assert_eq!(claimed.attempts, 1);
    }

    #[tokio::test]
    async fn delayed_job_not_claimed_early() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(60);
        let record = JobRecord::new("notification", "digest", vec![], RetryPolicy::default(), later, now);
        store.enqueue(record).await.unwrap();

        assert!(store.claim("notification", 1, LEASE, now).await.unwrap().is_none());
        assert!(store.claim("notification", 1, LEASE, later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_token_is_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.enqueue(waiting("email", now)).await.unwrap();
        let claimed = store.claim("email", 1, LEASE, now).await.unwrap().unwrap();

        let result = store
            .complete("email", &claimed.id, &LeaseToken::from("someone-else"), now)
            .await;
        assert!(matches!(result, Err(QueueError::InvalidLeaseToken(_))));
    }

    #[tokio::test]
    async fn remove_on_complete_drops_record() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut record = waiting("email", now);
        record.remove_on_complete = true;
        store.enqueue(record).await.unwrap();

        let claimed = store.claim("email", 1, LEASE, now).await.unwrap().unwrap();
        let token = claimed.lease_token.clone().unwrap();
        store.complete("email", &claimed.id, &token, now).await.unwrap();

        assert!(store.is_empty());
        assert_eq!(store.stats("email").await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn unavailable_store_fails_closed() {
        let store = MemoryStore::new();
        store.set_available(false);
        let result = store.enqueue(waiting("email", Utc::now())).await;
        assert!(matches!(result, Err(QueueError::BrokerUnavailable(_))));
        assert!(store.is_empty());

        store.set_available(true);
        assert!(store.enqueue(waiting("email", Utc::now())).await.is_ok());
    }

    #[tokio::test]
    async fn purge_refuses_active_job() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.enqueue(waiting("data-export", now)).await.unwrap();
        let claimed = store.claim("data-export", 1, LEASE, now).await.unwrap().unwrap();

        let result = store.purge("data-export", &claimed.id).await;
        assert!(matches!(result, Err(QueueError::InvalidState { state: JobState::Active, .. })));
    }

    #[tokio::test]
    async fn records_are_scoped_to_their_queue() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = waiting("email", now);
        let id = record.id.clone();
        store.enqueue(record).await.unwrap();

        assert!(store.get("notification", &id).await.unwrap().is_none());
        assert!(matches!(
            store.purge("notification", &id).await,
            Err(QueueError::NotFound { .. })
        ));
    }
}
