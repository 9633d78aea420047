//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use super::{env_var_or_default, env_var_or_default_bool, env_var_or_default_str};
use crate::constants::{
    DEFAULT_FIELD_MANAGER, DEFAULT_HEALTH_POLL_INTERVAL_MS, DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
    DEFAULT_OPERATION_TIMEOUT_SECS, DEFAULT_SOURCE_POLL_INTERVAL_SECS, DEFAULT_STALL_FACTOR,
    DEFAULT_TICK_INTERVAL_MS, DEFAULT_UNIT_INTERVAL,
};
use crate::controller::validation::parse_kubernetes_duration;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which backend the controller applies manifests to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMode {
    /// A live Kubernetes API server (server-side apply)
    Kubernetes,
    /// An in-process store, useful for dry runs and local experiments
    Memory,
}

impl FromStr for TargetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "kubernetes" | "kube" | "k8s" => Ok(Self::Kubernetes),
            "memory" | "in-memory" => Ok(Self::Memory),
            other => Err(format!("unknown target mode '{other}'")),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Directory holding the checked-out manifest tree
    pub source_path: PathBuf,
    /// How often the snapshot source is polled for a new revision (seconds)
    pub source_poll_interval_secs: u64,
    /// Scheduling tick (milliseconds)
    pub tick_interval_ms: u64,
    /// Worker pool size, independent of the number of units
    pub max_concurrent_reconciliations: usize,
    /// A pass running longer than `stall_factor * interval` is reported Stalled
    pub stall_factor: u32,
    /// Timeout for a single get/apply/delete call (seconds)
    pub operation_timeout_secs: u64,
    /// Delay between health check polls (milliseconds)
    pub health_poll_interval_ms: u64,
    /// Interval applied to units that do not declare one
    pub default_unit_interval: Duration,
    /// Field manager used for server-side apply
    pub field_manager: String,
    /// Target backend
    pub target_mode: TargetMode,
    /// Log format (json, text)
    pub log_format: LogFormat,
    /// Enable color in text format logs
    pub log_enable_color: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from("/var/lib/gitops-reconciler/source"),
            source_poll_interval_secs: DEFAULT_SOURCE_POLL_INTERVAL_SECS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            stall_factor: DEFAULT_STALL_FACTOR,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            health_poll_interval_ms: DEFAULT_HEALTH_POLL_INTERVAL_MS,
            default_unit_interval: Duration::from_secs(300),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            target_mode: TargetMode::Kubernetes,
            log_format: LogFormat::Json,
            log_enable_color: false,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let default_unit_interval = std::env::var("DEFAULT_UNIT_INTERVAL")
            .ok()
            .and_then(|v| parse_kubernetes_duration(&v).ok())
            .or_else(|| parse_kubernetes_duration(DEFAULT_UNIT_INTERVAL).ok())
            .unwrap_or(defaults.default_unit_interval);

        Self {
            source_path: std::env::var("SOURCE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.source_path),
            source_poll_interval_secs: env_var_or_default(
                "SOURCE_POLL_INTERVAL_SECS",
                DEFAULT_SOURCE_POLL_INTERVAL_SECS,
            ),
            tick_interval_ms: env_var_or_default("TICK_INTERVAL_MS", DEFAULT_TICK_INTERVAL_MS),
            max_concurrent_reconciliations: env_var_or_default(
                "MAX_CONCURRENT_RECONCILIATIONS",
                DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            )
            .max(1),
            stall_factor: env_var_or_default("STALL_FACTOR", DEFAULT_STALL_FACTOR).max(1),
            operation_timeout_secs: env_var_or_default(
                "OPERATION_TIMEOUT_SECS",
                DEFAULT_OPERATION_TIMEOUT_SECS,
            ),
            health_poll_interval_ms: env_var_or_default(
                "HEALTH_POLL_INTERVAL_MS",
                DEFAULT_HEALTH_POLL_INTERVAL_MS,
            ),
            default_unit_interval,
            field_manager: env_var_or_default_str("FIELD_MANAGER", DEFAULT_FIELD_MANAGER),
            target_mode: env_var_or_default("TARGET_MODE", defaults.target_mode),
            log_format: env_var_or_default("LOG_FORMAT", defaults.log_format),
            log_enable_color: env_var_or_default_bool("LOG_ENABLE_COLOR", false),
        }
    }

    /// Get source poll interval duration
    #[must_use]
    pub fn source_poll_interval(&self) -> Duration {
        Duration::from_secs(self.source_poll_interval_secs)
    }

    /// Get scheduling tick duration
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Get per-call target operation timeout
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Get health check poll interval
    #[must_use]
    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }
}
