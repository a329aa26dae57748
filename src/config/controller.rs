//! # Controller Configuration
//!
//! Ambient settings shared by both sidecars, loaded from environment variables.

use crate::constants::{
    DEFAULT_BACKOFF_MAX_MS, DEFAULT_BACKOFF_START_MS, DEFAULT_METRICS_PORT,
    DEFAULT_SERVER_POLL_INTERVAL_MS, DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
};
use std::time::Duration;

/// Controller-level configuration
///
/// All settings have defaults and can be overridden via environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Port of the metrics and probe server
    pub metrics_port: u16,
    /// Serve `/metrics`, `/healthz` and `/readyz`
    pub enable_metrics: bool,
    /// How long to wait for the metrics server to bind (seconds)
    pub server_startup_timeout_secs: u64,
    /// Poll interval while waiting for the metrics server (milliseconds)
    pub server_poll_interval_ms: u64,
    /// First requeue delay after a failed reconciliation (milliseconds)
    pub backoff_start_ms: u64,
    /// Requeue delay cap (milliseconds)
    pub backoff_max_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            enable_metrics: true,
            server_startup_timeout_secs: DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            server_poll_interval_ms: DEFAULT_SERVER_POLL_INTERVAL_MS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            metrics_port: parse_or(&lookup, "METRICS_PORT", defaults.metrics_port),
            enable_metrics: bool_or(&lookup, "ENABLE_METRICS", defaults.enable_metrics),
            server_startup_timeout_secs: parse_or(
                &lookup,
                "SERVER_STARTUP_TIMEOUT_SECS",
                defaults.server_startup_timeout_secs,
            ),
            server_poll_interval_ms: parse_or(
                &lookup,
                "SERVER_POLL_INTERVAL_MS",
                defaults.server_poll_interval_ms,
            ),
            backoff_start_ms: parse_or(&lookup, "BACKOFF_START_MS", defaults.backoff_start_ms),
            backoff_max_ms: parse_or(&lookup, "BACKOFF_MAX_MS", defaults.backoff_max_ms),
        }
    }

    #[must_use]
    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    #[must_use]
    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    #[must_use]
    pub fn server_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.server_startup_timeout_secs)
    }

    #[must_use]
    pub fn server_poll_interval(&self) -> Duration {
        Duration::from_millis(self.server_poll_interval_ms)
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn bool_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(default)
}
