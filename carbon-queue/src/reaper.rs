use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::JobBroker;

/// Periodic scan that requeues active jobs whose lease expired
pub struct StallReaper {
    broker: JobBroker,
    queues: Arc<[String]>,
    interval: Duration,
}

impl StallReaper {
    pub fn new(broker: JobBroker, interval: Duration) -> Self {
        let queues = broker.registry().list_queues().into();
        Self {
            broker,
            queues,
            interval,
        }
    }

    /// One pass over every queue; returns how many jobs were reaped
    pub async fn run_once(&self) -> usize {
        let mut total = 0;
        for queue in self.queues.iter() {
            match self.broker.reap_stalled(queue).await {
                Ok(0) => {}
                Ok(reaped) => {
                    warn!(queue = %queue, reaped, "Requeued stalled jobs");
                    total += reaped;
                }
                Err(e) => error!(queue = %queue, error = %e, "Stall scan failed"),
            }
        }
        total
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = self.interval.as_millis() as u64, "Stall reaper started");

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = self.run_once().await;
                        debug!(reaped, "Stall scan finished");
                    }
                    _ = shutdown.changed() => break,
                }
            }

            info!("Stall reaper stopped");
        })
    }
}
