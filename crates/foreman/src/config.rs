//! Pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a queue producer spreads jobs over the monitors that asked for
/// demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherStrategy {
    /// Serve demand in the order it arrived.
    #[default]
    Fifo,
    /// Serve a random pending demand unit.
    Random,
}

/// Per-pool configuration.
///
/// The worker module, queue backend, and failure mode are values rather
/// than configuration data and are passed to `Pool::start` directly.
///
/// # Example
///
/// ```
/// use foreman::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::new("thumbnails")
///     .with_num_workers(4)
///     .with_collect_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name; also the backend queue name.
    pub name: String,

    /// Register the pool as `(global, name)` so a shared registry serves
    /// it cluster-wide.
    #[serde(default)]
    pub global: bool,

    /// Queue producers to run.
    #[serde(default = "default_num_queues")]
    pub num_queues: usize,

    /// Workers (each with its own monitor) to run.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Delay before retrying a failed worker `init`.
    #[serde(with = "duration_millis", default = "default_init_retry")]
    pub init_retry: Duration,

    /// Default timeout for collecting a job result.
    #[serde(with = "duration_millis", default = "default_collect_timeout")]
    pub collect_timeout: Duration,

    /// Demand dispatch strategy.
    #[serde(default)]
    pub dispatcher: DispatcherStrategy,

    /// Declare the backend queue durable.
    #[serde(default = "default_true")]
    pub durable: bool,

    /// Exchange to publish through (backend-specific; empty means the
    /// default exchange).
    #[serde(default)]
    pub exchange: String,

    /// Safety bound on unacknowledged push deliveries per subscription.
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,

    /// Opaque arguments handed to the worker module's `init`.
    #[serde(default)]
    pub init_args: serde_json::Value,
}

fn default_num_queues() -> usize {
    1
}

fn default_num_workers() -> usize {
    10
}

fn default_init_retry() -> Duration {
    Duration::from_secs(5)
}

fn default_collect_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_prefetch() -> u16 {
    10
}

fn default_true() -> bool {
    true
}

impl PoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            global: false,
            num_queues: default_num_queues(),
            num_workers: default_num_workers(),
            init_retry: default_init_retry(),
            collect_timeout: default_collect_timeout(),
            dispatcher: DispatcherStrategy::default(),
            durable: true,
            exchange: String::new(),
            prefetch: default_prefetch(),
            init_args: serde_json::Value::Null,
        }
    }

    pub fn with_global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    pub fn with_num_queues(mut self, n: usize) -> Self {
        self.num_queues = n.max(1);
        self
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n.max(1);
        self
    }

    pub fn with_init_retry(mut self, delay: Duration) -> Self {
        self.init_retry = delay;
        self
    }

    pub fn with_collect_timeout(mut self, timeout: Duration) -> Self {
        self.collect_timeout = timeout;
        self
    }

    pub fn with_dispatcher(mut self, strategy: DispatcherStrategy) -> Self {
        self.dispatcher = strategy;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_init_args(mut self, args: serde_json::Value) -> Self {
        self.init_args = args;
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::new("p");
        assert_eq!(config.num_queues, 1);
        assert_eq!(config.num_workers, 10);
        assert_eq!(config.init_retry, Duration::from_secs(5));
        assert_eq!(config.collect_timeout, Duration::from_millis(5000));
        assert_eq!(config.prefetch, 10);
        assert!(config.durable);
        assert_eq!(config.dispatcher, DispatcherStrategy::Fifo);
    }

    #[test]
    fn test_builder() {
        let config = PoolConfig::new("p")
            .with_num_queues(2)
            .with_num_workers(3)
            .with_prefetch(0)
            .with_dispatcher(DispatcherStrategy::Random);

        assert_eq!(config.num_queues, 2);
        assert_eq!(config.num_workers, 3);
        // Clamped to a sane floor.
        assert_eq!(config.prefetch, 1);
        assert_eq!(config.dispatcher, DispatcherStrategy::Random);
    }

    #[test]
    fn test_serde_round_trip() {
        let config = PoolConfig::new("p").with_init_retry(Duration::from_millis(250));
        let json = serde_json::to_string(&config).unwrap();
        let back: PoolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "p");
        assert_eq!(back.init_retry, Duration::from_millis(250));
    }
}
