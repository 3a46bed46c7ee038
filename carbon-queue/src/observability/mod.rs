pub mod bus;
pub mod logging;
pub mod metrics;

#[cfg(feature = "tracing-basic")]
pub mod tracing;

pub use bus::{EventBus, EventSubscriber, SubscriptionId};
pub use logging::LogSubscriber;
pub use metrics::{LiveMetrics, QueueCounters};

#[cfg(feature = "tracing-basic")]
pub use self::tracing::init_tracing;
