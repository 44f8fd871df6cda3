//! Configuration for rentflowd

use rentflow_adapters::RailConfig;
use rentflow_core::{SettlementConfig, StorageConfig};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage for leases, obligations and the audit ledger
    #[serde(default)]
    pub storage: StorageConfig,

    /// Polling, transfer ceiling and autonomy gate policy
    #[serde(default)]
    pub settlement: SettlementConfig,

    /// Active payment rail
    #[serde(default)]
    pub rail: RailConfig,

    /// Reconciliation sweep
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            enable_cors: true,
        }
    }
}

/// Reconciliation sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between sweeps over submitted obligations
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Run the periodic sweep at all
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            enabled: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8095))
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Layer defaults, an optional file and `RENTFLOW__*` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `RENTFLOW__RAIL__API_KEY`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RENTFLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8095);
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.rail.label(), "simulated");
        assert!(config.settlement.validate().is_ok());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = DaemonConfig::load(None).unwrap();
        assert_eq!(config.scheduler.reconcile_interval_secs, 60);
        assert_eq!(config.settlement.poll.max_attempts, 30);
    }

    #[test]
    fn test_sample_config_parses() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/rentflowd.toml");
        let config = DaemonConfig::load(Some(path)).unwrap();
        assert_eq!(config.settlement.currency.code, "USDC");
        assert_eq!(config.settlement.gate.history_max_samples, 50);
        assert!(config.scheduler.enabled);
    }
}
