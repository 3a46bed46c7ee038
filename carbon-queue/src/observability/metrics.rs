use dashmap::DashMap;
use serde::Serialize;

use super::EventSubscriber;
use crate::JobEvent;

/// Event counters for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounters {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    /// Terminal failures only
    pub failed: u64,
    /// Failed attempts that were rescheduled
    pub retried: u64,
    pub stalled: u64,
}

/// Live per-queue event counters, fed from the event bus
#[derive(Debug, Default)]
pub struct LiveMetrics {
    queues: DashMap<String, QueueCounters>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, name: &str) -> QueueCounters {
        self.queues.get(name).map(|c| *c).unwrap_or_default()
    }

    /// Snapshot of every queue seen so far, sorted by name
    pub fn snapshot(&self) -> Vec<(String, QueueCounters)> {
        let mut all: Vec<(String, QueueCounters)> = self
            .queues
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn reset(&self) {
        self.queues.clear();
    }
}

impl EventSubscriber for LiveMetrics {
    fn on_event(&self, event: &JobEvent) {
        let mut counters = self.queues.entry(event.queue().to_string()).or_default();
        match event {
            JobEvent::Waiting { .. } => counters.waiting += 1,
            JobEvent::Active { .. } => counters.active += 1,
            JobEvent::Completed { .. } => counters.completed += 1,
            JobEvent::Failed { retry_at: Some(_), .. } => counters.retried += 1,
            JobEvent::Failed { retry_at: None, .. } => counters.failed += 1,
            JobEvent::Stalled { .. } => counters.stalled += 1,
        }
    }
}
