use thiserror::Error;

use crate::types::JobState;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Bad registration or configuration, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// A producer or operator referenced a queue that was never registered
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Job not found: {queue}/{job_id}")]
    NotFound { queue: String, job_id: String },

    #[error("Job {job_id} is {state}, expected {expected}")]
    InvalidState {
        job_id: String,
        state: JobState,
        expected: &'static str,
    },

    /// The claim this worker held is gone (reaped, retried or purged)
    #[error("Lease token no longer valid for job {0}")]
    InvalidLeaseToken(String),

    /// The broker store cannot be reached; nothing was written
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker shutdown")]
    WorkerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(queue: &str, job_id: impl ToString) -> Self {
        Self::NotFound {
            queue: queue.to_string(),
            job_id: job_id.to_string(),
        }
    }

    /// True when retrying the same store call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_) | Self::Internal(_))
    }

    /// True when the caller no longer owns the job it tried to report on
    pub fn is_claim_lost(&self) -> bool {
        matches!(
            self,
            Self::InvalidLeaseToken(_) | Self::NotFound { .. } | Self::InvalidState { .. }
        )
    }
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - will schedule retry if attempts remain
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Terminal error - fail immediately, no retry
    #[error("Terminal error: {0}")]
    Terminal(String),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a terminal error
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Terminal(msg) => msg,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::BrokerUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_classification() {
        let transient = JobError::retryable("smtp timeout");
        let invalid = JobError::terminal("missing recipient");

        assert!(transient.is_retryable());
        assert!(!invalid.is_retryable());
        assert_eq!(transient.message(), "smtp timeout");
        assert_eq!(invalid.message(), "missing recipient");
    }

    #[test]
    fn claim_lost_variants() {
        assert!(QueueError::InvalidLeaseToken("j1".into()).is_claim_lost());
        assert!(QueueError::not_found("email", "j1").is_claim_lost());
        assert!(!QueueError::BrokerUnavailable("down".into()).is_claim_lost());
        assert!(QueueError::BrokerUnavailable("down".into()).is_transient());
    }
}
