//! Queue configuration.
//!
//! Everything the engine needs besides the shard and the observer hooks:
//! pool sizing, polling cadence, lease durations, retry policy, routing and
//! partition filters. Invalid values fail fast when the queue is built.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use super::item::{validate_queue_name, Kind, DEFAULT_MAX_ATTEMPTS};
use crate::scheduler::BackoffPolicy;

/// Default duration of the cluster-wide sequential lease.
pub const DEFAULT_SEQUENTIAL_LEASE_DURATION: Duration = Duration::from_secs(10);

/// Default duration of an item lease.
pub const DEFAULT_ITEM_LEASE_DURATION: Duration = Duration::from_secs(20);

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// How the dispatcher groups partitions for fairness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Partitions are visited in earliest-ready order with round-robin rotation.
    #[default]
    Function,
    /// Accounts are visited round-robin, then their partitions.
    Account,
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "function" | "fn" => Ok(RunMode::Function),
            "account" => Ok(RunMode::Account),
            other => Err(format!("unknown run mode '{other}'")),
        }
    }
}

/// Configuration for a queue and its worker pool.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    // Pool settings
    /// Number of concurrent executors.
    pub num_workers: usize,
    /// How long an idle executor sleeps before polling again.
    pub poll_interval: Duration,
    /// Maximum number of items read from one partition per peek.
    pub peek_limit: usize,
    /// Maximum number of partitions considered per scheduling pass.
    pub partition_limit: usize,

    // Lease settings
    /// Duration of an item lease. Renewed every half duration while the handler runs.
    pub item_lease_duration: Duration,
    /// Duration of the sequential lease.
    pub sequential_lease_duration: Duration,
    /// How often the sequential lease is acquired or renewed.
    pub sequential_renew_interval: Duration,

    // Retry settings
    /// Attempts allowed for items that don't set their own maximum.
    pub default_max_attempts: u32,
    /// Delay curve between attempts.
    pub backoff: BackoffPolicy,
    /// Maximum number of entries kept in the dead-letter list.
    pub dead_letter_max: usize,

    // Routing and filters
    /// Routes items of a kind into a named queue.
    pub kind_to_queue_map: HashMap<String, String>,
    /// When non-empty, only these queue names are dispatched.
    pub allow_queue_names: HashSet<String>,
    /// Queue names that are never dispatched.
    pub deny_queue_names: HashSet<String>,
    /// Fairness grouping.
    pub run_mode: RunMode,

    /// Identity of this node in lease tokens.
    pub node_id: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            num_workers: 100,
            poll_interval: Duration::from_millis(150),
            peek_limit: 10,
            partition_limit: 100,

            item_lease_duration: DEFAULT_ITEM_LEASE_DURATION,
            sequential_lease_duration: DEFAULT_SEQUENTIAL_LEASE_DURATION,
            sequential_renew_interval: DEFAULT_SEQUENTIAL_LEASE_DURATION / 3,

            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            dead_letter_max: 10_000,

            kind_to_queue_map: HashMap::new(),
            allow_queue_names: HashSet::new(),
            deny_queue_names: HashSet::new(),
            run_mode: RunMode::Function,

            node_id: format!("node-{}", Uuid::new_v4()),
        }
    }
}

impl QueueConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FAIRQ_NUM_WORKERS`: Concurrent executors (default: 100)
    /// - `FAIRQ_POLL_INTERVAL_MS`: Idle poll interval (default: 150)
    /// - `FAIRQ_PEEK_LIMIT`: Items per partition peek (default: 10)
    /// - `FAIRQ_PARTITION_LIMIT`: Partitions per scan (default: 100)
    /// - `FAIRQ_ITEM_LEASE_SECS`: Item lease duration (default: 20)
    /// - `FAIRQ_SEQUENTIAL_LEASE_SECS`: Sequential lease duration (default: 10)
    /// - `FAIRQ_DEFAULT_MAX_ATTEMPTS`: Default attempts per item (default: 3)
    /// - `FAIRQ_BACKOFF_INITIAL_MS`: First retry delay (default: 10000)
    /// - `FAIRQ_BACKOFF_MAX_MS`: Retry delay cap (default: 600000)
    /// - `FAIRQ_DEAD_LETTER_MAX`: Dead-letter list size (default: 10000)
    /// - `FAIRQ_ALLOW_QUEUES`: Comma-separated allow-list
    /// - `FAIRQ_DENY_QUEUES`: Comma-separated deny-list
    /// - `FAIRQ_RUN_MODE`: `function` or `account` (default: function)
    /// - `FAIRQ_NODE_ID`: Node identity (default: random)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Pool settings
        if let Ok(val) = std::env::var("FAIRQ_NUM_WORKERS") {
            config.num_workers = parse_env_value(&val, "FAIRQ_NUM_WORKERS")?;
        }

        if let Ok(val) = std::env::var("FAIRQ_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "FAIRQ_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("FAIRQ_PEEK_LIMIT") {
            config.peek_limit = parse_env_value(&val, "FAIRQ_PEEK_LIMIT")?;
        }

        if let Ok(val) = std::env::var("FAIRQ_PARTITION_LIMIT") {
            config.partition_limit = parse_env_value(&val, "FAIRQ_PARTITION_LIMIT")?;
        }

        // Lease settings
        if let Ok(val) = std::env::var("FAIRQ_ITEM_LEASE_SECS") {
            let secs: u64 = parse_env_value(&val, "FAIRQ_ITEM_LEASE_SECS")?;
            config.item_lease_duration = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("FAIRQ_SEQUENTIAL_LEASE_SECS") {
            let secs: u64 = parse_env_value(&val, "FAIRQ_SEQUENTIAL_LEASE_SECS")?;
            config = config.with_sequential_lease_duration(Duration::from_secs(secs));
        }

        // Retry settings
        if let Ok(val) = std::env::var("FAIRQ_DEFAULT_MAX_ATTEMPTS") {
            config.default_max_attempts = parse_env_value(&val, "FAIRQ_DEFAULT_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("FAIRQ_BACKOFF_INITIAL_MS") {
            let ms: u64 = parse_env_value(&val, "FAIRQ_BACKOFF_INITIAL_MS")?;
            config.backoff.initial = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("FAIRQ_BACKOFF_MAX_MS") {
            let ms: u64 = parse_env_value(&val, "FAIRQ_BACKOFF_MAX_MS")?;
            config.backoff.max = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("FAIRQ_DEAD_LETTER_MAX") {
            config.dead_letter_max = parse_env_value(&val, "FAIRQ_DEAD_LETTER_MAX")?;
        }

        // Routing and filters
        if let Ok(val) = std::env::var("FAIRQ_ALLOW_QUEUES") {
            config.allow_queue_names = parse_env_list(&val);
        }

        if let Ok(val) = std::env::var("FAIRQ_DENY_QUEUES") {
            config.deny_queue_names = parse_env_list(&val);
        }

        if let Ok(val) = std::env::var("FAIRQ_RUN_MODE") {
            config.run_mode = val
                .parse()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "FAIRQ_RUN_MODE".to_string(),
                    message,
                })?;
        }

        if let Ok(val) = std::env::var("FAIRQ_NODE_ID") {
            config.node_id = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Pool validation
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.peek_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "peek_limit must be greater than 0".to_string(),
            ));
        }

        if self.partition_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "partition_limit must be greater than 0".to_string(),
            ));
        }

        // Lease validation
        if self.item_lease_duration < Duration::from_millis(10) {
            return Err(ConfigError::ValidationFailed(
                "item_lease_duration must be at least 10ms".to_string(),
            ));
        }

        if self.sequential_lease_duration.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sequential_lease_duration must be greater than 0".to_string(),
            ));
        }

        if self.sequential_renew_interval.is_zero()
            || self.sequential_renew_interval >= self.sequential_lease_duration
        {
            return Err(ConfigError::ValidationFailed(
                "sequential_renew_interval must be greater than 0 and shorter than sequential_lease_duration"
                    .to_string(),
            ));
        }

        if self.node_id.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "node_id cannot be empty".to_string(),
            ));
        }

        // Retry validation
        if self.default_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.dead_letter_max == 0 {
            return Err(ConfigError::ValidationFailed(
                "dead_letter_max must be greater than 0".to_string(),
            ));
        }

        self.backoff
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(format!("backoff: {e}")))?;

        // Routing validation
        for (kind, queue) in &self.kind_to_queue_map {
            validate_queue_name(queue).map_err(|e| {
                ConfigError::ValidationFailed(format!("kind_to_queue_map[{kind}]: {e}"))
            })?;
        }

        if let Some(name) = self
            .allow_queue_names
            .intersection(&self.deny_queue_names)
            .next()
        {
            return Err(ConfigError::ValidationFailed(format!(
                "queue '{name}' is in both allow_queue_names and deny_queue_names"
            )));
        }

        Ok(())
    }

    /// Returns the queue a kind is routed to, if any.
    pub fn queue_for_kind(&self, kind: &Kind) -> Option<&str> {
        self.kind_to_queue_map.get(kind.as_str()).map(String::as_str)
    }

    /// Returns whether a partition with the given resolved queue name may be
    /// dispatched. Partitions without a queue name never match a non-empty
    /// allow-list.
    pub fn is_queue_allowed(&self, queue_name: Option<&str>) -> bool {
        match queue_name {
            Some(name) => {
                if self.deny_queue_names.contains(name) {
                    return false;
                }
                self.allow_queue_names.is_empty() || self.allow_queue_names.contains(name)
            }
            None => self.allow_queue_names.is_empty(),
        }
    }

    /// Builder method to set the number of executors.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Builder method to set the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the per-partition peek limit.
    pub fn with_peek_limit(mut self, limit: usize) -> Self {
        self.peek_limit = limit;
        self
    }

    /// Builder method to set the per-scan partition limit.
    pub fn with_partition_limit(mut self, limit: usize) -> Self {
        self.partition_limit = limit;
        self
    }

    /// Builder method to set the item lease duration.
    pub fn with_item_lease_duration(mut self, duration: Duration) -> Self {
        self.item_lease_duration = duration;
        self
    }

    /// Builder method to set the sequential lease duration. Also resets the
    /// renew interval to a third of the duration.
    pub fn with_sequential_lease_duration(mut self, duration: Duration) -> Self {
        self.sequential_lease_duration = duration;
        self.sequential_renew_interval = duration / 3;
        self
    }

    /// Builder method to set the sequential renew interval.
    pub fn with_sequential_renew_interval(mut self, interval: Duration) -> Self {
        self.sequential_renew_interval = interval;
        self
    }

    /// Builder method to set the default max attempts.
    pub fn with_default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts;
        self
    }

    /// Builder method to set the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Builder method to set the dead-letter list size.
    pub fn with_dead_letter_max(mut self, max: usize) -> Self {
        self.dead_letter_max = max;
        self
    }

    /// Builder method to route a kind into a named queue.
    pub fn with_kind_queue(mut self, kind: impl Into<Kind>, queue: impl Into<String>) -> Self {
        self.kind_to_queue_map
            .insert(kind.into().as_str().to_string(), queue.into());
        self
    }

    /// Builder method to set the queue allow-list.
    pub fn with_allow_queue_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_queue_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to set the queue deny-list.
    pub fn with_deny_queue_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny_queue_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to set the run mode.
    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    /// Builder method to set the node identity.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse a comma-separated environment variable into a set.
fn parse_env_list(value: &str) -> HashSet<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.num_workers, 100);
        assert_eq!(config.poll_interval, Duration::from_millis(150));
        assert_eq!(config.item_lease_duration, Duration::from_secs(20));
        assert_eq!(config.sequential_lease_duration, Duration::from_secs(10));
        assert!(config.sequential_renew_interval < config.sequential_lease_duration);
        assert_eq!(config.default_max_attempts, 3);
        assert_eq!(config.run_mode, RunMode::Function);
        assert!(config.node_id.starts_with("node-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = QueueConfig::new()
            .with_num_workers(4)
            .with_poll_interval(Duration::from_millis(20))
            .with_sequential_lease_duration(Duration::from_secs(3))
            .with_kind_queue("test-kind", "custom")
            .with_allow_queue_names(["custom"])
            .with_run_mode(RunMode::Account)
            .with_node_id("node-a");

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.sequential_renew_interval, Duration::from_secs(1));
        assert_eq!(
            config.queue_for_kind(&Kind::Custom("test-kind".to_string())),
            Some("custom")
        );
        assert_eq!(config.queue_for_kind(&Kind::Edge), None);
        assert_eq!(config.run_mode, RunMode::Account);
        assert_eq!(config.node_id, "node-a");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_workers() {
        let result = QueueConfig::default().with_num_workers(0).validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("num_workers"));
    }

    #[test]
    fn test_validation_renew_interval() {
        let result = QueueConfig::default()
            .with_sequential_renew_interval(Duration::from_secs(10))
            .validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("sequential_renew_interval"));
    }

    #[test]
    fn test_validation_zero_attempts() {
        let result = QueueConfig::default()
            .with_default_max_attempts(0)
            .validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("default_max_attempts"));
    }

    #[test]
    fn test_validation_zero_dead_letter_max() {
        let result = QueueConfig::default().with_dead_letter_max(0).validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("dead_letter_max"));
        assert!(QueueConfig::default()
            .with_dead_letter_max(1)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_validation_conflicting_filters() {
        let result = QueueConfig::default()
            .with_allow_queue_names(["a", "b"])
            .with_deny_queue_names(["b"])
            .validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("'b'"));
    }

    #[test]
    fn test_validation_bad_kind_queue() {
        let result = QueueConfig::default()
            .with_kind_queue(Kind::Pause, "bad name")
            .validate();
        assert!(result.is_err());
    }

    #[test]
    fn test_queue_filters() {
        let open = QueueConfig::default();
        assert!(open.is_queue_allowed(Some("anything")));
        assert!(open.is_queue_allowed(None));

        let allow = QueueConfig::default().with_allow_queue_names(["A"]);
        assert!(allow.is_queue_allowed(Some("A")));
        assert!(!allow.is_queue_allowed(Some("B")));
        assert!(!allow.is_queue_allowed(None));

        let deny = QueueConfig::default().with_deny_queue_names(["D"]);
        assert!(!deny.is_queue_allowed(Some("D")));
        assert!(deny.is_queue_allowed(Some("E")));
        assert!(deny.is_queue_allowed(None));
    }

    #[test]
    fn test_run_mode_parse() {
        assert_eq!("account".parse::<RunMode>(), Ok(RunMode::Account));
        assert_eq!("Function".parse::<RunMode>(), Ok(RunMode::Function));
        assert!("round-robin".parse::<RunMode>().is_err());
    }

    #[test]
    fn test_parse_env_list() {
        let set = parse_env_list("a, b,,c ");
        assert_eq!(set.len(), 3);
        assert!(set.contains("b"));
        assert!(set.contains("c"));
    }
}
