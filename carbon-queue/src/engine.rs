use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    admin::AdminApi,
    backend::BrokerStore,
    broker::JobBroker,
    config::EngineConfig,
    dispatcher::QueueDispatcher,
    job::{JobHandler, QueueRegistry},
    observability::{EventBus, EventSubscriber, LogSubscriber},
    reaper::StallReaper,
    JobId, JobOptions, QueueError, QueueOptions, QueueResult,
};

/// Composition root: registry, broker, event bus, dispatchers and reaper
pub struct QueueEngine {
    broker: JobBroker,
    config: Arc<EngineConfig>,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    slots: Vec<(String, Vec<JoinHandle<()>>)>,
    reaper: JoinHandle<()>,
}

pub struct QueueEngineBuilder {
    store: Arc<dyn BrokerStore>,
    config: EngineConfig,
    registry: QueueRegistry,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    log_events: bool,
    registration_error: Option<QueueError>,
}

impl QueueEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a queue; registration errors surface from [`build`](Self::build)
    pub fn queue(mut self, name: impl Into<String>, options: QueueOptions, handler: Arc<dyn JobHandler>) -> Self {
        if self.registration_error.is_none() {
            if let Err(e) = self.registry.register(name, options, Some(handler)) {
                self.registration_error = Some(e);
            }
        }
        self
    }

    /// Use a registry built elsewhere, replacing queues added so far
    pub fn registry(mut self, registry: QueueRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Install the lifecycle [`LogSubscriber`] (on by default)
    pub fn log_events(mut self, enabled: bool) -> Self {
        self.log_events = enabled;
        self
    }

    pub fn build(self) -> QueueResult<QueueEngine> {
        if let Some(e) = self.registration_error {
            return Err(e);
        }
        self.config.validate()?;
        if self.registry.is_empty() {
            return Err(QueueError::config("no queues registered"));
        }

        let events = EventBus::new(self.config.event_capacity);
        if self.log_events {
            events.subscribe(Arc::new(LogSubscriber));
        }
        for subscriber in self.subscribers {
            events.subscribe(subscriber);
        }

        let broker = JobBroker::new(
            self.store,
            Arc::new(self.registry),
            events,
            self.config.lease_duration,
        );

        Ok(QueueEngine {
            broker,
            config: Arc::new(self.config),
            running: Mutex::new(None),
        })
    }
}

impl QueueEngine {
    pub fn builder(store: impl BrokerStore + 'static) -> QueueEngineBuilder {
        Self::builder_with(Arc::new(store))
    }

    pub fn builder_with(store: Arc<dyn BrokerStore>) -> QueueEngineBuilder {
        QueueEngineBuilder {
            store,
            config: EngineConfig::default(),
            registry: QueueRegistry::new(),
            subscribers: Vec::new(),
            log_events: true,
            registration_error: None,
        }
    }

    /// Spawn every queue's dispatcher slots and the stall reaper
    pub fn start(&self) -> QueueResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(QueueError::config("engine already started"));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slots = self
            .broker
            .registry()
            .iter()
            .map(|queue| {
                let dispatcher = QueueDispatcher::new(self.broker.clone(), queue.clone(), self.config.clone());
                (queue.name().to_string(), dispatcher.spawn(shutdown_rx.clone()))
            })
            .collect();
        let reaper = StallReaper::new(self.broker.clone(), self.config.reaper_interval).spawn(shutdown_rx);

        *running = Some(Running {
            shutdown_tx,
            slots,
            reaper,
        });
        info!("All queues initialized successfully");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop claiming, wait for in-flight jobs to report, then stop the reaper
    pub async fn shutdown(&self) -> QueueResult<()> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };
        let _ = running.shutdown_tx.send(true);

        let mut failures = 0;
        for (queue, slots) in running.slots {
            let mut closed = true;
            for joined in join_all(slots).await {
                if let Err(e) = joined {
                    closed = false;
                    error!(queue = %queue, error = %e, "Error closing queue {}", queue);
                }
            }
            if closed {
                info!(queue = %queue, "Queue {} closed successfully", queue);
            } else {
                failures += 1;
            }
        }
        if let Err(e) = running.reaper.await {
            error!(error = %e, "Stall reaper did not stop cleanly");
        }

        if failures > 0 {
            return Err(QueueError::Internal(format!("{failures} queue(s) did not close cleanly")));
        }
        info!("All queues closed successfully");
        Ok(())
    }

    pub async fn enqueue(&self, queue: &str, payload: Vec<u8>, options: JobOptions) -> QueueResult<JobId> {
        self.broker.enqueue(queue, payload, options).await
    }

    pub async fn enqueue_json<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        options: JobOptions,
    ) -> QueueResult<JobId> {
        self.broker.enqueue_json(queue, payload, options).await
    }

    pub fn admin(&self) -> AdminApi {
        AdminApi::new(self.broker.clone())
    }

    pub fn events(&self) -> &EventBus {
        self.broker.events()
    }

    pub fn broker(&self) -> &JobBroker {
        &self.broker
    }

    pub fn registry(&self) -> &QueueRegistry {
        self.broker.registry()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one stall scan now instead of waiting for the reaper interval
    pub async fn reap_stalled(&self) -> usize {
        StallReaper::new(self.broker.clone(), self.config.reaper_interval)
            .run_once()
            .await
    }
}

impl Drop for QueueEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown_tx.send(true);
        }
    }
}
