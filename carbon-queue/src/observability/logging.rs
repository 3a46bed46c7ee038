use tracing::{error, info, warn};

use super::EventSubscriber;
use crate::JobEvent;

/// Logs every lifecycle event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSubscriber;

impl EventSubscriber for LogSubscriber {
    fn on_event(&self, event: &JobEvent) {
        match event {
            JobEvent::Waiting {
                job_id, queue, name, ..
            } => info!(%job_id, %queue, %name, "Job {} in queue {} waiting", job_id, queue),
            JobEvent::Active {
                job_id,
                queue,
                attempt,
                ..
            } => info!(%job_id, %queue, attempt, "Job {} in queue {} started processing", job_id, queue),
            JobEvent::Completed {
                job_id,
                queue,
                attempt,
                ..
            } => info!(%job_id, %queue, attempt, "Job {} in queue {} completed", job_id, queue),
            JobEvent::Failed {
                job_id,
                queue,
                attempt,
                error,
                retry_at: Some(retry_at),
                ..
            } => warn!(
                %job_id,
                %queue,
                attempt,
                %retry_at,
                "Job {} in queue {} failed, retrying: {}",
                job_id,
                queue,
                error
            ),
            JobEvent::Failed {
                job_id,
                queue,
                attempt,
                error,
                retry_at: None,
                ..
            } => error!(%job_id, %queue, attempt, "Job {} in queue {} failed: {}", job_id, queue, error),
            JobEvent::Stalled {
                job_id,
                queue,
                attempt,
                ..
            } => warn!(%job_id, %queue, attempt, "Job {} in queue {} stalled", job_id, queue),
        }
    }
}
