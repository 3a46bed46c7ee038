use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::broker::JobBroker;
use crate::config::EngineConfig;
use crate::job::RegisteredQueue;
use crate::{ClaimedJob, JobError};

/// Doubling sleep between `min` and `max`, restarted by `reset`
#[derive(Debug, Clone)]
pub(crate) struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl IdleBackoff {
    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: None,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.min,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

/// Pool of execution slots for one queue, one task per unit of concurrency
pub(crate) struct QueueDispatcher {
    broker: JobBroker,
    queue: Arc<RegisteredQueue>,
    config: Arc<EngineConfig>,
}

impl QueueDispatcher {
    pub(crate) fn new(broker: JobBroker, queue: Arc<RegisteredQueue>, config: Arc<EngineConfig>) -> Self {
        Self {
            broker,
            queue,
            config,
        }
    }

    pub(crate) fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            queue = self.queue.name(),
            concurrency = self.queue.concurrency(),
            "Starting dispatcher"
        );
        (0..self.queue.concurrency())
            .map(|slot| {
                let worker = Slot {
                    slot,
                    broker: self.broker.clone(),
                    queue: self.queue.clone(),
                    config: self.config.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}

struct Slot {
    slot: usize,
    broker: JobBroker,
    queue: Arc<RegisteredQueue>,
    config: Arc<EngineConfig>,
    shutdown: watch::Receiver<bool>,
}

impl Slot {
    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay`; true when shutdown was signalled first
    async fn pause(&mut self, delay: Duration) -> bool {
        if self.shutting_down() {
            return true;
        }
        tokio::select! {
            _ = sleep(delay) => false,
            _ = self.shutdown.changed() => true,
        }
    }

    async fn run(mut self) {
        let mut idle = IdleBackoff::new(self.config.poll_interval_min, self.config.poll_interval_max);
        let mut store_backoff = IdleBackoff::new(self.config.store_retry_min, self.config.store_retry_max);
        debug!(queue = self.queue.name(), slot = self.slot, "Slot started");

        while !self.shutting_down() {
            match self.broker.claim(self.queue.name()).await {
                Ok(Some(job)) => {
                    idle.reset();
                    store_backoff.reset();
                    self.execute(job).await;
                }
                Ok(None) => {
                    store_backoff.reset();
                    if self.pause(idle.next_delay()).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(queue = self.queue.name(), slot = self.slot, error = %e, "Claim failed");
                    if self.pause(store_backoff.next_delay()).await {
                        break;
                    }
                }
            }
        }

        debug!(queue = self.queue.name(), slot = self.slot, "Slot stopped");
    }

    #[instrument(skip_all, fields(queue = %job.queue(), job_id = %job.id(), attempt = job.attempt()))]
    async fn execute(&mut self, job: ClaimedJob) {
        let outcome = self.run_handler(&job).await;
        if let Err(e) = &outcome {
            debug!(retryable = e.is_retryable(), error = e.message(), "Handler failed");
        }
        self.report(&job, outcome).await;
    }

    /// Run the handler on its own task, renewing the lease until it finishes or times out
    async fn run_handler(&self, job: &ClaimedJob) -> Result<(), JobError> {
        let handler = self.queue.handler();
        let record = job.record.clone();
        let mut task = tokio::spawn(async move { handler.process(&record).await });

        let timeout = job.record.timeout.or(self.config.default_job_timeout);
        let expiry = async move {
            match timeout {
                Some(limit) => sleep_until(Instant::now() + limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        let every = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(outcome) => outcome,
                        Err(e) if e.is_panic() => Err(JobError::retryable(format!(
                            "handler panicked: {}",
                            panic_message(e.into_panic().as_ref())
                        ))),
                        Err(e) => Err(JobError::retryable(format!("handler aborted: {e}"))),
                    };
                }
                _ = &mut expiry => {
                    task.abort();
                    let limit = timeout.unwrap_or_default();
                    warn!(timeout_ms = limit.as_millis() as u64, "Job timed out");
                    return Err(JobError::retryable(format!(
                        "job timed out after {}ms",
                        limit.as_millis()
                    )));
                }
                _ = heartbeat.tick() => match self.broker.extend_lease(job).await {
                    Ok(_) => {}
                    Err(e) if e.is_claim_lost() => {
                        task.abort();
                        warn!(error = %e, "Claim lost while running, handler stopped");
                        return Err(JobError::retryable(format!("claim lost: {e}")));
                    }
                    Err(e) => warn!(error = %e, "Lease renewal failed"),
                },
            }
        }
    }

    /// Report the outcome exactly once, retrying transient store errors until shutdown
    async fn report(&mut self, job: &ClaimedJob, outcome: Result<(), JobError>) {
        let mut backoff = IdleBackoff::new(self.config.store_retry_min, self.config.store_retry_max);
        loop {
            let reported = match &outcome {
                Ok(()) => self.broker.complete(job).await,
                Err(e) => self.broker.fail(job, e).await.map(|_| ()),
            };
            match reported {
                Ok(()) => return,
                Err(e) if e.is_claim_lost() => {
                    warn!(error = %e, "Outcome discarded, job no longer held by this worker");
                    return;
                }
                Err(e) if self.shutting_down() => {
                    error!(error = %e, "Could not report outcome before shutdown; lease will expire");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Failed to report outcome, retrying");
                    self.pause(backoff.next_delay()).await;
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
