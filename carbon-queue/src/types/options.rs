use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::RetryPolicy;
use crate::{QueueError, QueueResult};

/// Per-queue configuration fixed at registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Max simultaneously active jobs for the queue across all workers
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Drop the job record as soon as it completes
    pub remove_on_complete: bool,
    /// Per-job execution timeout; `None` falls back to the engine default
    pub timeout: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retry: RetryPolicy::default(),
            remove_on_complete: false,
            timeout: None,
        }
    }
}

impl QueueOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = remove;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.concurrency < 1 {
            return Err(QueueError::config("queue concurrency must be >= 1"));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(QueueError::config("queue timeout must be non-zero"));
        }
        self.retry.validate()
    }
}

/// Producer-side overrides applied to a single job at enqueue time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Job name within the queue, e.g. `verification` inside `email`
    pub name: Option<String>,
    pub attempts: Option<u32>,
    pub backoff: Option<RetryPolicy>,
    /// Initial delay before the first attempt becomes eligible
    pub delay: Option<Duration>,
    pub remove_on_complete: Option<bool>,
    pub timeout: Option<Duration>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = Some(remove);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Effective retry policy for a job enqueued into a queue with `queue_policy`
    pub fn resolve_retry(&self, queue_policy: &RetryPolicy) -> QueueResult<RetryPolicy> {
        let mut policy = self.backoff.clone().unwrap_or_else(|| queue_policy.clone());
        if let Some(attempts) = self.attempts {
            policy.max_attempts = attempts;
        }
        policy.validate()?;
        Ok(policy)
    }
}
