use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobId;

/// Lifecycle event kinds published on the event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Waiting,
    Active,
    Completed,
    Failed,
    Stalled,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stalled => "stalled",
        }
    }
}

/// Lifecycle event, one per state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    /// Job became eligible for claim (enqueue or operator retry)
    Waiting {
        job_id: JobId,
        queue: String,
        name: String,
        at: DateTime<Utc>,
    },

    /// Job was claimed by a worker
    Active {
        job_id: JobId,
        queue: String,
        attempt: u32,
        lease_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    Completed {
        job_id: JobId,
        queue: String,
        attempt: u32,
        at: DateTime<Utc>,
    },

    /// An attempt failed; `retry_at` is set when the job was rescheduled
    Failed {
        job_id: JobId,
        queue: String,
        attempt: u32,
        error: String,
        retry_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },

    /// The lease on an active job expired without a report
    Stalled {
        job_id: JobId,
        queue: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Waiting { .. } => EventKind::Waiting,
            Self::Active { .. } => EventKind::Active,
            Self::Completed { .. } => EventKind::Completed,
            Self::Failed { .. } => EventKind::Failed,
            Self::Stalled { .. } => EventKind::Stalled,
        }
    }

    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Waiting { job_id, .. }
            | Self::Active { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Stalled { job_id, .. } => job_id,
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            Self::Waiting { queue, .. }
            | Self::Active { queue, .. }
            | Self::Completed { queue, .. }
            | Self::Failed { queue, .. }
            | Self::Stalled { queue, .. } => queue,
        }
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Waiting { at, .. }
            | Self::Active { at, .. }
            | Self::Completed { at, .. }
            | Self::Failed { at, .. }
            | Self::Stalled { at, .. } => at,
        }
    }

    /// True for a failure that will not be retried
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Failed { retry_at: None, .. })
    }
}
