use std::time::Duration;

use crate::{QueueError, QueueResult};

/// Engine-wide tuning shared by every queue
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Lease granted on claim; an unreported job stalls once it runs out
    pub lease_duration: Duration,
    /// How often a running job renews its lease
    pub heartbeat_interval: Duration,
    /// How often the reaper scans for expired leases
    pub reaper_interval: Duration,
    /// Idle sleep after the first empty claim
    pub poll_interval_min: Duration,
    /// Cap for the idle sleep between empty claims
    pub poll_interval_max: Duration,
    /// Backoff bounds for retrying a failed store call
    pub store_retry_min: Duration,
    pub store_retry_max: Duration,
    /// Per-job timeout for queues and jobs that set none; `None` is unbounded
    pub default_job_timeout: Option<Duration>,
    /// Buffer of the broadcast channel behind `EventBus::stream`
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            reaper_interval: Duration::from_secs(30),
            poll_interval_min: Duration::from_millis(50),
            poll_interval_max: Duration::from_secs(1),
            store_retry_min: Duration::from_millis(100),
            store_retry_max: Duration::from_secs(3),
            default_job_timeout: None,
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `QUEUE_*` environment variables (durations in milliseconds)
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> QueueResult<Self> {
        let mut config = Self::default();
        let millis = |key: &str| -> QueueResult<Option<Duration>> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(|e| QueueError::config(format!("{key}={raw}: {e}")))
                })
                .transpose()
        };

        if let Some(v) = millis("QUEUE_LEASE_MS")? {
            config.lease_duration = v;
        }
        if let Some(v) = millis("QUEUE_HEARTBEAT_MS")? {
            config.heartbeat_interval = v;
        }
        if let Some(v) = millis("QUEUE_REAPER_INTERVAL_MS")? {
            config.reaper_interval = v;
        }
        if let Some(v) = millis("QUEUE_POLL_MIN_MS")? {
            config.poll_interval_min = v;
        }
        if let Some(v) = millis("QUEUE_POLL_MAX_MS")? {
            config.poll_interval_max = v;
        }
        if let Some(v) = millis("QUEUE_STORE_RETRY_MIN_MS")? {
            config.store_retry_min = v;
        }
        if let Some(v) = millis("QUEUE_STORE_RETRY_MAX_MS")? {
            config.store_retry_max = v;
        }
        if let Some(v) = millis("QUEUE_JOB_TIMEOUT_MS")? {
            config.default_job_timeout = Some(v);
        }
        if let Some(raw) = lookup("QUEUE_EVENT_CAPACITY") {
            config.event_capacity = raw
                .trim()
                .parse()
                .map_err(|e| QueueError::config(format!("QUEUE_EVENT_CAPACITY={raw}: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> QueueResult<()> {
        let durations = [
            ("lease_duration", self.lease_duration),
            ("heartbeat_interval", self.heartbeat_interval),
            ("reaper_interval", self.reaper_interval),
            ("poll_interval_min", self.poll_interval_min),
            ("poll_interval_max", self.poll_interval_max),
            ("store_retry_min", self.store_retry_min),
            ("store_retry_max", self.store_retry_max),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(QueueError::config(format!("{name} must be non-zero")));
        }
        if self.poll_interval_min > self.poll_interval_max {
            return Err(QueueError::config("poll_interval_min exceeds poll_interval_max"));
        }
        if self.store_retry_min > self.store_retry_max {
            return Err(QueueError::config("store_retry_min exceeds store_retry_max"));
        }
        if self.heartbeat_interval >= self.lease_duration {
            return Err(QueueError::config(
                "heartbeat_interval must be shorter than lease_duration",
            ));
        }
        if self.default_job_timeout.is_some_and(|t| t.is_zero()) {
            return Err(QueueError::config("default_job_timeout must be non-zero"));
        }
        if self.event_capacity == 0 {
            return Err(QueueError::config("event_capacity must be >= 1"));
        }
        Ok(())
    }
}

/// Connection settings for the Redis store
#[cfg(feature = "redis")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// Full connection URL; takes precedence over host/port/password
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Prefix of every key the store writes
    pub key_prefix: String,
    pub max_connect_attempts: u32,
}

#[cfg(feature = "redis")]
impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            key_prefix: "carbon-queue".to_string(),
            max_connect_attempts: 10,
        }
    }
}

#[cfg(feature = "redis")]
impl RedisConfig {
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> QueueResult<Self> {
        let mut config = Self {
            url: lookup("REDIS_URL").filter(|url| !url.is_empty()),
            password: lookup("REDIS_PASSWORD").filter(|pw| !pw.is_empty()),
            ..Self::default()
        };
        if let Some(host) = lookup("REDIS_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|e| QueueError::config(format!("REDIS_PORT={port}: {e}")))?;
        }
        if let Some(prefix) = lookup("REDIS_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        Ok(config)
    }

    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}", password, self.host, self.port),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }

    /// Delay before connection attempt `attempt + 1`
    pub fn reconnect_delay(attempt: u32) -> Duration {
        Duration::from_millis((u64::from(attempt) * 100).min(3000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn env_overrides_defaults() {
        let config = EngineConfig::from_lookup(vars(&[
            ("QUEUE_LEASE_MS", "5000"),
            ("QUEUE_HEARTBEAT_MS", "1000"),
            ("QUEUE_JOB_TIMEOUT_MS", "250"),
            ("QUEUE_EVENT_CAPACITY", "64"),
        ]))
        .unwrap();

        assert_eq!(config.lease_duration, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.default_job_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.reaper_interval, Duration::from_secs(30));
    }

    #[test]
    fn rejects_malformed_and_inconsistent_values() {
        assert!(matches!(
            EngineConfig::from_lookup(vars(&[("QUEUE_LEASE_MS", "soon")])),
            Err(QueueError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_lookup(vars(&[("QUEUE_HEARTBEAT_MS", "60000")])),
            Err(QueueError::Config(msg)) if msg.contains("heartbeat_interval")
        ));

        let config = EngineConfig {
            poll_interval_min: Duration::from_secs(2),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[cfg(feature = "redis")]
    #[test]
    fn redis_url_from_parts() {
        let config = RedisConfig::from_lookup(vars(&[
            ("REDIS_HOST", "cache"),
            ("REDIS_PORT", "6380"),
            ("REDIS_PASSWORD", "secret"),
        ]))
        .unwrap();
        assert_eq!(config.connection_url(), "redis://:secret@cache:6380");
        assert_eq!(config.key_prefix, "carbon-queue");

        let config = RedisConfig::from_lookup(vars(&[("REDIS_URL", "redis://other:1")])).unwrap();
        assert_eq!(config.connection_url(), "redis://other:1");
    }

    #[cfg(feature = "redis")]
    #[test]
    fn reconnect_delay_is_capped() {
        assert_eq!(RedisConfig::reconnect_delay(1), Duration::from_millis(100));
        assert_eq!(RedisConfig::reconnect_delay(25), Duration::from_millis(2500));
        assert_eq!(RedisConfig::reconnect_delay(40), Duration::from_millis(3000));
    }
}
