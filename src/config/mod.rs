use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration: {0}")]
    MissingField(String),
    #[error("invalid configuration: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    pub listen: String,
    pub backends: Vec<BackendConfig>,
    pub assignment_path: Option<String>,
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    pub metrics_listen: Option<String>,
    pub log: Option<LogConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

/// Timing knobs for the resolver's three background timers (spec §4.4).
/// All fields default to the literal values from the specification.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RebalanceConfig {
    pub full_reassign_after_secs: u64,
    pub balance_start_after_secs: u64,
    pub balance_period_secs: u64,
    pub balance_until_secs: u64,
    pub persist_start_after_secs: u64,
    pub persist_period_secs: u64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        RebalanceConfig {
            full_reassign_after_secs: 5 * 60,
            balance_start_after_secs: 10 * 60,
            balance_period_secs: 2 * 60,
            balance_until_secs: 30 * 60,
            persist_start_after_secs: 10 * 60,
            persist_period_secs: 60 * 60,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::MissingField("backends are empty".to_string()));
        }
        if self.listen.is_empty() {
            return Err(ConfigError::InvalidValue("listen address is empty".to_string()));
        }
        if self.rebalance.balance_until_secs <= self.rebalance.balance_start_after_secs {
            return Err(ConfigError::InvalidValue(
                "rebalance.balance_until_secs must be after balance_start_after_secs".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(host: &str, port: u16) -> BackendConfig {
        BackendConfig { host: host.to_string(), port }
    }

    #[test]
    fn rejects_empty_backends() {
        let cfg = Config {
            listen: "0.0.0.0:4242".to_string(),
            backends: vec![],
            assignment_path: None,
            health_check: None,
            rebalance: RebalanceConfig::default(),
            metrics_listen: None,
            log: None,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_minimal_valid_config() {
        let cfg = Config {
            listen: "0.0.0.0:4242".to_string(),
            backends: vec![backend("h1", 1001), backend("h2", 1002)],
            assignment_path: None,
            health_check: None,
            rebalance: RebalanceConfig::default(),
            metrics_listen: None,
            log: None,
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_balance_until_before_start() {
        let mut rebalance = RebalanceConfig::default();
        rebalance.balance_until_secs = rebalance.balance_start_after_secs;
        let cfg = Config {
            listen: "0.0.0.0:4242".to_string(),
            backends: vec![backend("h1", 1001)],
            assignment_path: None,
            health_check: None,
            rebalance,
            metrics_listen: None,
            log: None,
        };
        assert!(cfg.validate().is_err());
    }
}
