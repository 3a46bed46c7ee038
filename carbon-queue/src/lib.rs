//! # carbon-queue
//!
//! Background job engine: named queues with their own concurrency limit,
//! retry policy and handler, backed by a broker store with atomic claims.
//!
//! - **Lease-based claims**: a claim moves one job to `active` atomically and
//!   grants a lease; a reaper requeues jobs whose lease ran out.
//! - **Retry with backoff**: retryable failures are rescheduled with fixed or
//!   exponential backoff until `max_attempts`; terminal failures fail at once.
//! - **Lifecycle events**: `waiting`, `active`, `completed`, `failed` and
//!   `stalled`, delivered to subscribers and async streams.
//! - **Operator surface**: queue stats, failed-job listing, manual retry and
//!   purge through [`AdminApi`] (and an axum router with the `ui` feature).
//!
//! ## Quick start
//!
//! ```no_run
//! use carbon_queue::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Verification {
//!     email: String,
//! }
//!
//! # async fn run() -> QueueResult<()> {
//! let engine = QueueEngine::builder(MemoryStore::new())
//!     .queue(
//!         presets::EMAIL,
//!         presets::default_queue_options().with_concurrency(2),
//!         json_handler(|job: Verification| async move {
//!             if job.email.contains('@') {
//!                 Ok(())
//!             } else {
//!                 Err(JobError::terminal("invalid address"))
//!             }
//!         }),
//!     )
//!     .build()?;
//!
//! engine.start()?;
//! let payload = Verification { email: "ada@example.com".into() };
//! engine
//!     .enqueue_json(presets::EMAIL, &payload, JobOptions::named("verification"))
//!     .await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod backend;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod observability;
pub mod presets;
pub mod reaper;
pub mod types;

mod dispatcher;

pub use admin::AdminApi;
pub use backend::{BoxStream, BrokerStore};
pub use broker::{next_attempt_at, JobBroker};
pub use config::EngineConfig;
pub use engine::{QueueEngine, QueueEngineBuilder};
pub use error::{JobError, QueueError, QueueResult};
pub use job::{handler_fn, json_handler, FnHandler, JobHandler, JsonHandler, QueueHandle, QueueRegistry, RegisteredQueue};
pub use observability::{EventBus, EventSubscriber, LiveMetrics, LogSubscriber, SubscriptionId};
pub use reaper::StallReaper;
pub use types::{
    BackoffKind, ClaimedJob, EventKind, JobEvent, JobId, JobOptions, JobRecord, JobState, LeaseToken,
    QueueOptions, QueueStats, RetryPolicy,
};

#[cfg(feature = "memory")]
pub use backend::memory::MemoryStore;

#[cfg(feature = "redis")]
pub use backend::redis::RedisStore;

#[cfg(feature = "redis")]
pub use config::RedisConfig;

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Common imports for producers and handler authors
pub mod prelude {
    pub use crate::{
        handler_fn, json_handler, presets, AdminApi, EngineConfig, JobError, JobEvent, JobHandler, JobId,
        JobOptions, JobRecord, JobState, QueueEngine, QueueError, QueueOptions, QueueResult, RetryPolicy,
    };

    #[cfg(feature = "memory")]
    pub use crate::MemoryStore;

    #[cfg(feature = "redis")]
    pub use crate::{RedisConfig, RedisStore};

    pub use async_trait::async_trait;
}
