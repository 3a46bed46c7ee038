use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::{JobId, LeaseToken, RetryPolicy};
use crate::{QueueError, QueueResult};

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Eligible for claim, in FIFO order
    Waiting,
    /// Claimed by exactly one worker under a lease
    Active,
    /// Finished successfully (terminal)
    Completed,
    /// Finished unsuccessfully, never reclaimed automatically (terminal)
    Failed,
    /// Waiting for `next_run_at` before becoming eligible
    Delayed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        Self::Waiting,
        Self::Active,
        Self::Completed,
        Self::Failed,
        Self::Delayed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "delayed" => Ok(Self::Delayed),
            other => Err(QueueError::Serialization(format!("unknown job state: {other}"))),
        }
    }
}

/// Full job record as held by the broker store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    /// Job name within the queue (`default` when the producer gives none)
    pub name: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    pub state: JobState,
    /// Execution attempts so far, incremented on each claim
    pub attempts: u32,
    /// Retry policy snapshot; `retry.max_attempts` is the job's max attempts
    pub retry: RetryPolicy,
    pub remove_on_complete: bool,
    pub timeout: Option<Duration>,
    /// Eligible for claim only when `now >= next_run_at`
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub lease_token: Option<LeaseToken>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// New record in `waiting`, or `delayed` when `run_at` lies in the future
    pub fn new(
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: Vec<u8>,
        retry: RetryPolicy,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let state = if run_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        Self {
            id: JobId::new(),
            queue: queue.into(),
            name: name.into(),
            payload,
            state,
            attempts: 0,
            retry,
            remove_on_complete: false,
            timeout: None,
            next_run_at: run_at.max(now),
            last_error: None,
            lease_token: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempts < self.retry.max_attempts
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.next_run_at <= now
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lease_expires_at.is_some_and(|at| at < now)
    }

    pub fn holds_lease(&self, token: &LeaseToken) -> bool {
        self.state == JobState::Active && self.lease_token.as_ref() == Some(token)
    }

    /// Decode the payload as JSON
    pub fn json<T: DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn mark_active(&mut self, token: LeaseToken, lease_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.attempts += 1;
        self.lease_token = Some(token);
        self.lease_expires_at = Some(lease_until);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.last_error = None;
        self.release(now);
    }

    /// Failed attempt: reschedule at `retry_at` or fail terminally
    pub fn mark_failed(&mut self, error: String, retry_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.last_error = Some(error);
        match retry_at {
            Some(at) => {
                self.state = JobState::Delayed;
                self.next_run_at = at.max(self.next_run_at);
            }
            None => self.state = JobState::Failed,
        }
        self.release(now);
    }

    /// Operator retry of a failed job
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Waiting;
        self.attempts = 0;
        self.next_run_at = now.max(self.next_run_at);
        self.release(now);
    }

    fn release(&mut self, now: DateTime<Utc>) {
        self.lease_token = None;
        self.lease_expires_at = None;
        self.updated_at = now;
    }
}

/// A job claimed by a worker, together with the lease that proves the claim
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub record: JobRecord,
    pub lease_token: LeaseToken,
    pub lease_expires_at: DateTime<Utc>,
}

impl ClaimedJob {
    /// Build from a record the store just moved to `active`
    pub fn from_active(record: JobRecord) -> QueueResult<Self> {
        match (record.lease_token.clone(), record.lease_expires_at) {
            (Some(lease_token), Some(lease_expires_at)) if record.state == JobState::Active => Ok(Self {
                record,
                lease_token,
                lease_expires_at,
            }),
            _ => Err(QueueError::Internal(format!(
                "store returned job {} without an active lease",
                record.id
            ))),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.record.id
    }

    pub fn queue(&self) -> &str {
        &self.record.queue
    }

    pub fn attempt(&self) -> u32 {
        self.record.attempts
    }
}

/// Per-state job counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub failed: usize,
    pub completed: usize,
}

impl QueueStats {
    pub fn count(&self, state: JobState) -> usize {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Active => self.active,
            JobState::Delayed => self.delayed,
            JobState::Failed => self.failed,
            JobState::Completed => self.completed,
        }
    }

    pub fn bump(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Active => self.active += 1,
            JobState::Delayed => self.delayed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Completed => self.completed += 1,
        }
    }

    /// Jobs not yet in a terminal state
    pub fn pending(&self) -> usize {
        self.waiting + self.active + self.delayed
    }
}
