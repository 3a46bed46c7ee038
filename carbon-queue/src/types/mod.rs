pub mod ids;
pub mod policy;
pub mod options;
pub mod record;
pub mod events;

pub use ids::{JobId, LeaseToken};
pub use policy::{BackoffKind, RetryPolicy, DEFAULT_CEILING_FACTOR};
pub use options::{JobOptions, QueueOptions};
pub use record::{ClaimedJob, JobRecord, JobState, QueueStats};
pub use events::{EventKind, JobEvent};

use chrono::{DateTime, Utc};

/// `at + delay`, saturating at the maximum representable instant
pub(crate) fn after(at: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
