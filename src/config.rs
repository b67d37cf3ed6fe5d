// ABOUTME: Runtime configuration for the coordination core.
// ABOUTME: Deserializable from JSON with defaults, or assembled through CoreConfigBuilder.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Requester class used by the task dispatcher.
pub const DISPATCHER_REQUESTER: &str = "dispatcher";

/// Lock priority and timeout for one class of requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterProfile {
    /// Lower is more urgent.
    pub priority: u32,
    pub lock_timeout_ms: u64,
}

impl RequesterProfile {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Token bucket parameters for per-resource action pacing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Actions allowed back to back before pacing kicks in.
    pub burst: f64,
    /// Sustained actions per minute.
    pub per_minute: f64,
}

/// Thresholds for the health state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Number of most recent outcomes considered.
    pub window_size: usize,
    /// Below this many samples the success-rate signal is ignored.
    pub min_samples: usize,
    /// Success rate below which a resource is suspended.
    pub suspend_below: f64,
    /// Success rate below which a resource is shadow restricted.
    pub restrict_below: f64,
    /// Failure streak at which a resource is rate limited.
    pub consecutive_failures: usize,
    /// How far pending work is pushed out on shadow restriction.
    pub shadow_pause_hours: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            window_size: 50,
            min_samples: 10,
            suspend_below: 0.30,
            restrict_below: 0.60,
            consecutive_failures: 5,
            shadow_pause_hours: 24,
        }
    }
}

/// Configuration for every component of the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Per-requester-class lock priority and timeout.
    pub requesters: HashMap<String, RequesterProfile>,
    /// Profile for requesters with no entry in `requesters`.
    pub default_requester: RequesterProfile,
    pub max_queue_depth: usize,
    pub max_concurrent_sessions: usize,
    pub session_idle_timeout_ms: u64,
    pub session_sweep_interval_ms: u64,
    pub dispatch_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    /// Upper bound on a single automation backend call.
    pub action_timeout_ms: u64,
    /// Attempts before a task is marked failed.
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Delay before retrying a task whose lock or session could not be had.
    pub lock_retry_delay_ms: u64,
    /// Grace period for in-flight tasks during shutdown.
    pub shutdown_grace_ms: u64,
    /// Daily limit per action kind. Kinds not listed are unlimited.
    pub daily_limits: HashMap<String, u32>,
    pub pacing: Option<PacingConfig>,
    pub health: HealthThresholds,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let mut requesters = HashMap::new();
        requesters.insert(
            "monitor".to_string(),
            RequesterProfile {
                priority: 1,
                lock_timeout_ms: 60_000,
            },
        );
        requesters.insert(
            DISPATCHER_REQUESTER.to_string(),
            RequesterProfile {
                priority: 5,
                lock_timeout_ms: 300_000,
            },
        );

        Self {
            requesters,
            default_requester: RequesterProfile {
                priority: 10,
                lock_timeout_ms: 300_000,
            },
            max_queue_depth: 10,
            max_concurrent_sessions: 5,
            session_idle_timeout_ms: 30 * 60_000,
            session_sweep_interval_ms: 60_000,
            dispatch_interval_ms: 2 * 60_000,
            health_check_interval_ms: 15 * 60_000,
            reconcile_interval_ms: 5 * 60_000,
            action_timeout_ms: 120_000,
            max_attempts: 3,
            retry_backoff_ms: 30 * 60_000,
            lock_retry_delay_ms: 60_000,
            shutdown_grace_ms: 10_000,
            daily_limits: HashMap::new(),
            pacing: None,
            health: HealthThresholds::default(),
        }
    }
}

impl CoreConfig {
    /// Create a new config builder seeded with defaults.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::new()
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject settings the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_sessions must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        let h = &self.health;
        if h.window_size == 0 || h.min_samples > h.window_size {
            return Err(ConfigError::Invalid(format!(
                "health window ({}) must be non-zero and hold min_samples ({})",
                h.window_size, h.min_samples
            )));
        }
        if !(0.0..=1.0).contains(&h.suspend_below)
            || !(0.0..=1.0).contains(&h.restrict_below)
            || h.suspend_below > h.restrict_below
        {
            return Err(ConfigError::Invalid(
                "success-rate bands must satisfy 0 <= suspend_below <= restrict_below <= 1".into(),
            ));
        }
        if let Some(p) = &self.pacing {
            if p.burst < 1.0 || p.per_minute <= 0.0 {
                return Err(ConfigError::Invalid("pacing needs burst >= 1 and a positive rate".into()));
            }
        }
        Ok(())
    }

    /// Profile for a requester, falling back to the default class.
    pub fn profile(&self, requester: &str) -> RequesterProfile {
        self.requesters
            .get(requester)
            .copied()
            .unwrap_or(self.default_requester)
    }

    pub fn lock_timeout(&self, requester: &str) -> Duration {
        self.profile(requester).lock_timeout()
    }

    pub fn priority(&self, requester: &str) -> u32 {
        self.profile(requester).priority
    }

    pub fn daily_limit(&self, kind: &str) -> Option<u32> {
        self.daily_limits.get(kind).copied()
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.session_sweep_interval_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Builder for constructing configs in code.
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl Default for CoreConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
        }
    }

    /// Register or replace a requester class.
    pub fn requester(mut self, name: impl Into<String>, priority: u32, timeout: Duration) -> Self {
        self.config.requesters.insert(
            name.into(),
            RequesterProfile {
                priority,
                lock_timeout_ms: timeout.as_millis() as u64,
            },
        );
        self
    }

    pub fn default_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_requester.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.config.max_queue_depth = depth;
        self
    }

    pub fn max_concurrent_sessions(mut self, max: usize) -> Self {
        self.config.max_concurrent_sessions = max;
        self
    }

    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn session_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.session_sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn dispatch_interval(mut self, interval: Duration) -> Self {
        self.config.dispatch_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.config.reconcile_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn action_timeout(mut self, timeout: Duration) -> Self {
        self.config.action_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn lock_retry_delay(mut self, delay: Duration) -> Self {
        self.config.lock_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Set the daily limit for an action kind.
    pub fn daily_limit(mut self, kind: impl Into<String>, limit: u32) -> Self {
        self.config.daily_limits.insert(kind.into(), limit);
        self
    }

    pub fn pacing(mut self, burst: f64, per_minute: f64) -> Self {
        self.config.pacing = Some(PacingConfig { burst, per_minute });
        self
    }

    pub fn health(mut self, thresholds: HealthThresholds) -> Self {
        self.config.health = thresholds;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<CoreConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.window_size, 50);
        assert_eq!(config.dispatch_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_unknown_requester_uses_default_profile() {
        let config = CoreConfig::default();
        assert_eq!(config.priority("monitor"), 1);
        assert_eq!(config.priority("someone-else"), 10);
        assert_eq!(config.lock_timeout("someone-else"), Duration::from_secs(300));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = CoreConfig::from_json_str(
            r#"{"max_concurrent_sessions": 2, "daily_limits": {"follow": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_sessions, 2);
        assert_eq!(config.daily_limit("follow"), Some(10));
        assert_eq!(config.daily_limit("like"), None);
        assert_eq!(config.max_queue_depth, 10);
    }

    #[test]
    fn test_from_json_rejects_bad_bands() {
        let result =
            CoreConfig::from_json_str(r#"{"health": {"suspend_below": 0.8, "restrict_below": 0.6}}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_builder_sets_values() {
        let config = CoreConfig::builder()
            .requester("monitor", 0, Duration::from_millis(250))
            .max_queue_depth(3)
            .daily_limit("follow", 10)
            .pacing(2.0, 30.0)
            .build()
            .unwrap();
        assert_eq!(config.priority("monitor"), 0);
        assert_eq!(config.lock_timeout("monitor"), Duration::from_millis(250));
        assert_eq!(config.max_queue_depth, 3);
        assert!(config.pacing.is_some());
    }

    #[test]
    fn test_from_file_reads_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"max_attempts": 5, "pacing": {"burst": 3.0, "per_minute": 12.0}}"#,
        )
        .unwrap();

        let config = tokio_test::assert_ok!(CoreConfig::from_file(file.path()));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(
            config.pacing,
            Some(PacingConfig {
                burst: 3.0,
                per_minute: 12.0
            })
        );
    }

    #[test]
    fn test_from_file_missing_is_io_error() {
        let result = CoreConfig::from_file(Path::new("/nonexistent/campaign.json"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_builder_rejects_zero_sessions() {
        let result = CoreConfig::builder().max_concurrent_sessions(0).build();
        assert!(result.is_err());
    }
}
