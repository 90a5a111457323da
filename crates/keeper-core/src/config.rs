//! Configuration types for keeper-core.
//!
//! [`WrapperConfig`] tunes recovery, health probing and command queueing of a
//! single [`EngineWrapper`](crate::EngineWrapper); [`PoolConfig`] tunes the
//! capacity and eviction policies of an [`EnginePool`](crate::EnginePool).
//! Both can be built in code or read from YAML as part of a [`KeeperConfig`].
//! Missing keys fall back to the builder defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::ConfigError;

// ── Wrapper Configuration ────────────────────────────────────

/// Behavior of one engine wrapper.
///
/// Time values are milliseconds so the YAML form stays flat; use the
/// `Duration` accessors in code.
///
/// # Examples
///
/// ```
/// use keeper_core::WrapperConfig;
///
/// let config = WrapperConfig::builder()
///     .max_recovery_attempts(5)
///     .health_check_interval_ms(0)
///     .build();
/// assert!(config.health_check_interval().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default, rename_all = "camelCase")]
pub struct WrapperConfig {
    /// Replace the engine process automatically after a timeout.
    #[builder(default = true)]
    pub auto_recover: bool,

    /// Recovery attempts allowed before the circuit breaker opens.
    #[builder(default = 3)]
    pub max_recovery_attempts: u32,

    /// Backoff before the first recovery attempt.
    #[builder(default = 1_000)]
    pub recovery_base_delay_ms: u64,

    /// Upper bound for the backoff delay.
    #[builder(default = 10_000)]
    pub recovery_max_delay_ms: u64,

    /// Growth factor applied to the delay after each failed attempt.
    #[builder(default = 2.0)]
    pub recovery_backoff_multiplier: f64,

    /// Liveness probe period while ready. Zero disables health checks.
    #[builder(default = 30_000)]
    pub health_check_interval_ms: u64,

    /// How long a single probe may wait for its acknowledgment.
    #[builder(default = 5_000)]
    pub health_check_timeout_ms: u64,

    /// Time after the last failure before an open circuit accepts `init()`.
    #[builder(default = 60_000)]
    pub circuit_reset_ms: u64,

    /// Hold commands issued during recovery instead of rejecting them.
    #[builder(default = true)]
    pub queue_during_recovery: bool,

    /// Maximum number of commands held during recovery.
    #[builder(default = 10)]
    pub max_queue_size: usize,

    /// Bound on process start plus configuration replay.
    #[builder(default = 10_000)]
    pub init_timeout_ms: u64,

    /// Bound on the acknowledgment of `apply_config` and `reset_for_new_game`.
    #[builder(default = 5_000)]
    pub command_timeout_ms: u64,

    /// Liveness probe sent to the engine.
    #[builder(default = String::from("isready"), setter(into))]
    pub probe_command: String,

    /// Response line acknowledging the probe.
    #[builder(default = String::from("readyok"), setter(into))]
    pub probe_ack: String,

    /// Directive that resets engine state between games.
    #[builder(default = String::from("ucinewgame"), setter(into))]
    pub new_game_command: String,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl WrapperConfig {
    /// Backoff before recovery attempt `attempt` (1-based):
    /// `min(base * multiplier^(attempt - 1), max)`.
    pub fn recovery_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.recovery_base_delay_ms as f64 * self.recovery_backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.recovery_max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Returns the health-check period, or `None` when disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0).then(|| Duration::from_millis(self.health_check_interval_ms))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn circuit_reset(&self) -> Duration {
        Duration::from_millis(self.circuit_reset_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

// ── Pool Configuration ───────────────────────────────────────

/// Capacity and eviction policies of an engine pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Maximum number of simultaneous allocations.
    #[builder(default = 4)]
    pub max_engines: usize,

    /// How long a released wrapper stays reusable before it is terminated.
    #[builder(default = 60_000)]
    pub idle_timeout_ms: u64,

    /// A wrapper released with a higher use count is recreated instead of idled.
    #[builder(default = 50)]
    pub max_uses_before_recreate: u32,

    /// Send the new-game directive when an idle wrapper is reused.
    #[builder(default = true)]
    pub reset_on_reuse: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

// ── File Configuration ───────────────────────────────────────

/// Top-level configuration file (`keeper.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeeperConfig {
    /// Settings applied to every wrapper the pool creates.
    pub wrapper: WrapperConfig,

    /// Pool policies.
    pub pool: PoolConfig,
}

/// Load [`KeeperConfig`] from a YAML file.
///
/// If the file does not exist, returns the default configuration.
///
/// # Errors
///
/// Returns `ConfigError::Io` if the file exists but cannot be read.
/// Returns `ConfigError::Yaml` if the file contains invalid YAML.
pub fn load_config(path: &Path) -> Result<KeeperConfig, ConfigError> {
    if !path.exists() {
        return Ok(KeeperConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    let config: KeeperConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_should_build_wrapper_config_with_defaults() {
        let config = WrapperConfig::default();

        assert!(config.auto_recover);
        assert_eq!(config.max_recovery_attempts, 3);
        assert_eq!(config.max_queue_size, 10);
        assert_eq!(config.probe_command, "isready");
        assert_eq!(config.probe_ack, "readyok");
        assert_eq!(config.new_game_command, "ucinewgame");
        assert_eq!(config.health_check_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_should_grow_recovery_delay_exponentially_up_to_cap() {
        let config = WrapperConfig::builder()
            .recovery_base_delay_ms(100)
            .recovery_max_delay_ms(1_000)
            .build();

        assert_eq!(config.recovery_delay(1), Duration::from_millis(100));
        assert_eq!(config.recovery_delay(2), Duration::from_millis(200));
        assert_eq!(config.recovery_delay(3), Duration::from_millis(400));
        assert_eq!(config.recovery_delay(5), Duration::from_millis(1_000));
        assert_eq!(config.recovery_delay(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_should_apply_custom_backoff_multiplier() {
        let config = WrapperConfig::builder()
            .recovery_base_delay_ms(100)
            .recovery_backoff_multiplier(3.0)
            .build();

        assert_eq!(config.recovery_delay(3), Duration::from_millis(900));
    }

    #[test]
    fn test_should_disable_health_checks_with_zero_interval() {
        let config = WrapperConfig::builder().health_check_interval_ms(0).build();
        assert!(config.health_check_interval().is_none());
    }

    #[test]
    fn test_should_deserialize_empty_yaml_to_defaults() {
        let config: KeeperConfig = serde_yaml::from_str("{}").expect("should parse");
        assert_eq!(config, KeeperConfig::default());
    }

    #[test]
    fn test_should_deserialize_partial_yaml() {
        let yaml = r#"
wrapper:
  maxRecoveryAttempts: 1
  healthCheckIntervalMs: 0
  probeCommand: ping
pool:
  maxEngines: 2
  resetOnReuse: false
"#;

        let config: KeeperConfig = serde_yaml::from_str(yaml).expect("should parse YAML");

        assert_eq!(config.wrapper.max_recovery_attempts, 1);
        assert_eq!(config.wrapper.probe_command, "ping");
        assert_eq!(config.wrapper.probe_ack, "readyok");
        assert!(config.wrapper.auto_recover);
        assert_eq!(config.pool.max_engines, 2);
        assert!(!config.pool.reset_on_reuse);
        assert_eq!(config.pool.max_uses_before_recreate, 50);
    }

    #[test]
    fn test_should_load_default_when_config_file_missing() {
        let path = PathBuf::from("/nonexistent/keeper.yaml");
        let config = load_config(&path).expect("should return default");
        assert_eq!(config, KeeperConfig::default());
    }

    #[test]
    fn test_should_load_config_from_tempfile() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let path = dir.path().join("keeper.yaml");
        std::fs::write(&path, "pool:\n  idleTimeoutMs: 250\n").expect("should write config");

        let config = load_config(&path).expect("should load config");
        assert_eq!(config.pool.idle_timeout(), Duration::from_millis(250));
        assert_eq!(config.pool.max_engines, 4);
    }

    #[test]
    fn test_should_reject_malformed_yaml() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let path = dir.path().join("keeper.yaml");
        std::fs::write(&path, "pool: [unclosed").expect("should write config");

        let result = load_config(&path);
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_should_serialize_pool_config_in_camel_case() {
        let value = serde_json::to_value(PoolConfig::default()).expect("should serialize");
        assert_eq!(value["maxEngines"], 4);
        assert_eq!(value["maxUsesBeforeRecreate"], 50);
    }
}
