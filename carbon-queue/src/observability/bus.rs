use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{error, warn};

use crate::backend::BoxStream;
use crate::JobEvent;

/// Synchronous consumer of lifecycle events.
///
/// Called inline on the emitting task, so implementations must be quick and
/// must not block. Use [`EventBus::stream`] for async consumers.
pub trait EventSubscriber: Send + Sync + 'static {
    fn on_event(&self, event: &JobEvent);
}

impl<F> EventSubscriber for F
where
    F: Fn(&JobEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &JobEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_subscription_id() -> SubscriptionId {
    SubscriptionId(SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Clone)]
struct SubscriberEntry {
    id: SubscriptionId,
    subscriber: Arc<dyn EventSubscriber>,
}

/// Fan-out of job lifecycle events.
///
/// Emission never fails and never blocks the job pipeline: a panicking
/// subscriber is caught and logged, and stream consumers that fall behind
/// lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<SubscriberEntry>>>,
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            subscribers: Arc::default(),
            sender,
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriptionId {
        let id = next_subscription_id();
        self.subscribers.write().push(SubscriberEntry { id, subscriber });
        id
    }

    pub fn subscribe_fn<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(f))
    }

    /// Remove a subscriber; returns false when the id was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|entry| entry.id != id);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Stream of every event emitted after this call
    pub fn stream(&self) -> BoxStream<JobEvent> {
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event stream lagged, events dropped");
                None
            }
        });
        Box::pin(stream)
    }

    pub fn emit(&self, event: JobEvent) {
        // Snapshot so no lock is held while subscribers run
        let snapshot: Vec<SubscriberEntry> = self.subscribers.read().clone();

        for entry in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| entry.subscriber.on_event(&event)));
            if outcome.is_err() {
                error!(
                    subscription = entry.id.0,
                    event = event.event_name(),
                    job_id = %event.job_id(),
                    "Event subscriber panicked"
                );
            }
        }

        // No receivers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
