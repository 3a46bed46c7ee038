//! Queue names and default options of the standard deployment.

use std::time::Duration;

use crate::{QueueOptions, RetryPolicy};

pub const EMAIL: &str = "email";
pub const PDF_GENERATION: &str = "pdf-generation";
pub const DATA_EXPORT: &str = "data-export";
pub const NOTIFICATION: &str = "notification";
pub const EMISSION_CALCULATION: &str = "emission-calculation";

pub const STANDARD_QUEUES: [&str; 5] = [
    EMAIL,
    PDF_GENERATION,
    DATA_EXPORT,
    NOTIFICATION,
    EMISSION_CALCULATION,
];

/// 3 attempts, exponential backoff from 1 s
pub fn default_retry_policy() -> RetryPolicy {
    RetryPolicy::exponential(3, Duration::from_millis(1000))
}

/// Completed jobs are dropped; failed jobs are always kept for the operator
pub fn default_queue_options() -> QueueOptions {
    QueueOptions::default()
        .with_retry(default_retry_policy())
        .with_remove_on_complete(true)
}
