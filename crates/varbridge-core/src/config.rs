//! Configuration for the variable store
//!
//! Every field has a default; `load` overlays `VARBRIDGE_*` environment
//! variables and `from_yaml_str` parses a YAML document.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::access::DefaultAccess;
use crate::error::{VarError, VarResult};

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Entries kept per variable history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Queue length per observer
    #[serde(default = "default_buffer")]
    pub observer_buffer: usize,

    /// Queue length per watch stream
    #[serde(default = "default_buffer")]
    pub watch_buffer: usize,

    /// Locks older than this are reclaimed
    #[serde(default = "default_lock_stale_timeout_ms")]
    pub lock_stale_timeout_ms: u64,

    /// Interval of the stale lock sweep
    #[serde(default = "default_lock_sweep_interval_ms")]
    pub lock_sweep_interval_ms: u64,

    /// Iterations a holder must have reported before it can be preempted
    #[serde(default = "default_preempt_min_iterations")]
    pub preempt_min_iterations: u64,

    /// Metric compared when tracking the best progress report
    #[serde(default = "default_primary_metric")]
    pub primary_metric: String,

    /// Access for variables without rules
    #[serde(default)]
    pub default_access: DefaultAccess,
}

fn default_history_limit() -> usize {
    100
}

fn default_buffer() -> usize {
    256
}

fn default_lock_stale_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_lock_sweep_interval_ms() -> u64 {
    30_000
}

fn default_preempt_min_iterations() -> u64 {
    10
}

fn default_primary_metric() -> String {
    "loss".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            observer_buffer: default_buffer(),
            watch_buffer: default_buffer(),
            lock_stale_timeout_ms: default_lock_stale_timeout_ms(),
            lock_sweep_interval_ms: default_lock_sweep_interval_ms(),
            preempt_min_iterations: default_preempt_min_iterations(),
            primary_metric: default_primary_metric(),
            default_access: DefaultAccess::default(),
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `VARBRIDGE_*` environment variables
    pub fn load() -> VarResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        info!("Loaded store configuration: {:?}", config);
        Ok(config)
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml_str(raw: &str) -> VarResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values returned by `lookup`; unparsable values are ignored
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "VARBRIDGE_HISTORY_LIMIT", &mut self.history_limit);
        override_parsed(&lookup, "VARBRIDGE_OBSERVER_BUFFER", &mut self.observer_buffer);
        override_parsed(&lookup, "VARBRIDGE_WATCH_BUFFER", &mut self.watch_buffer);
        override_parsed(&lookup, "VARBRIDGE_LOCK_STALE_TIMEOUT_MS", &mut self.lock_stale_timeout_ms);
        override_parsed(&lookup, "VARBRIDGE_LOCK_SWEEP_INTERVAL_MS", &mut self.lock_sweep_interval_ms);
        override_parsed(&lookup, "VARBRIDGE_PREEMPT_MIN_ITERATIONS", &mut self.preempt_min_iterations);

        if let Some(metric) = lookup("VARBRIDGE_PRIMARY_METRIC") {
            self.primary_metric = metric;
        }

        if let Some(access) = lookup("VARBRIDGE_DEFAULT_ACCESS") {
            match access.to_lowercase().as_str() {
                "open" => self.default_access = DefaultAccess::Open,
                "closed" => self.default_access = DefaultAccess::Closed,
                _ => warn!("Invalid VARBRIDGE_DEFAULT_ACCESS value: {}", access),
            }
        }
    }

    /// Reject values the store cannot run with
    pub fn validate(&self) -> VarResult<()> {
        let zero_checks = [
            ("history_limit", self.history_limit as u64),
            ("observer_buffer", self.observer_buffer as u64),
            ("watch_buffer", self.watch_buffer as u64),
            ("lock_stale_timeout_ms", self.lock_stale_timeout_ms),
            ("lock_sweep_interval_ms", self.lock_sweep_interval_ms),
        ];
        for (name, value) in zero_checks {
            if value == 0 {
                return Err(VarError::ConfigurationError(format!("{} must be greater than zero", name)));
            }
        }
        if self.primary_metric.trim().is_empty() {
            return Err(VarError::ConfigurationError("primary_metric must not be empty".to_string()));
        }
        Ok(())
    }

    /// Staleness timeout as a duration
    pub fn lock_stale_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_stale_timeout_ms)
    }

    /// Sweep interval as a duration
    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lock_sweep_interval_ms)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Invalid {} value: {}", key, raw),
        }
    }
}

/// Logging configuration consumed by the monitoring crate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to log records
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Emit JSON lines instead of pretty output
    #[serde(default)]
    pub json: bool,
}

fn default_service_name() -> String {
    "varbridge".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_filter: default_log_filter(),
            json: false,
        }
    }
}

impl MonitoringConfig {
    /// Defaults overridden by `VARBRIDGE_SERVICE_NAME`, `VARBRIDGE_LOG` and `VARBRIDGE_LOG_JSON`
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Ok(name) = env::var("VARBRIDGE_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(filter) = env::var("VARBRIDGE_LOG") {
            config.log_filter = filter;
        }
        if let Ok(json) = env::var("VARBRIDGE_LOG_JSON") {
            config.json = json.to_lowercase() == "true" || json == "1";
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.history_limit, 100);
        assert_eq!(config.primary_metric, "loss");
        assert_eq!(config.default_access, DefaultAccess::Open);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_skip_invalid_values() {
        let vars: HashMap<&str, &str> = [
            ("VARBRIDGE_HISTORY_LIMIT", "5"),
            ("VARBRIDGE_OBSERVER_BUFFER", "lots"),
            ("VARBRIDGE_DEFAULT_ACCESS", "Closed"),
        ]
        .into_iter()
        .collect();

        let mut config = StoreConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.history_limit, 5);
        assert_eq!(config.observer_buffer, 256);
        assert_eq!(config.default_access, DefaultAccess::Closed);
    }

    #[test]
    fn test_yaml_with_partial_fields() {
        let config = StoreConfig::from_yaml_str("history_limit: 3\ndefault_access: closed\n").unwrap();
        assert_eq!(config.history_limit, 3);
        assert_eq!(config.watch_buffer, 256);
        assert_eq!(config.default_access, DefaultAccess::Closed);
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(matches!(
            StoreConfig::from_yaml_str("observer_buffer: 0"),
            Err(VarError::ConfigurationError(_))
        ));
    }
}
