use std::{path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Could not parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("Invalid value for environment variable {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level config struct for the agent
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub logging: LoggingConfig,
    pub rpc: RpcConfig,
    pub collector: CollectorConfig,
    pub intervals: IntervalsConfig,
    pub history: HistoryConfig,
    pub connection: ConnectionConfig,
    pub alerting: AlertingConfig,
    pub metrics: MetricsConfig,
}

/// Identity of the monitored node as shown on the collector
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub name: String,
    pub contact: String,
    #[serde(rename = "nodeType")]
    pub node_type: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            contact: String::new(),
            node_type: "geth".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Monitored and reference JSON-RPC endpoints
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RpcConfig {
    pub url: String,
    /// Trusted node used for divergence alerts, disabled when empty
    #[serde(rename = "referenceUrl")]
    pub reference_url: String,
    #[serde(rename = "timeoutSeconds")]
    pub timeout_seconds: u64,
    #[serde(rename = "blockPollIntervalMs")]
    pub block_poll_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8545".to_string(),
            reference_url: String::new(),
            timeout_seconds: 30,
            block_poll_interval_ms: 4_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CollectorConfig {
    pub url: String,
    pub secret: String,
    #[serde(rename = "reconnectRetries")]
    pub reconnect_retries: u32,
    /// Connect timeout of the collector socket
    #[serde(rename = "timeoutSeconds")]
    pub timeout_seconds: u64,
    /// The link is considered dead when nothing arrives for this long
    #[serde(rename = "idleTimeoutSeconds")]
    pub idle_timeout_seconds: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000".to_string(),
            secret: "eth-net-stats-has-a-secret".to_string(),
            reconnect_retries: 30,
            timeout_seconds: 10,
            idle_timeout_seconds: 60,
        }
    }
}

impl CollectorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

/// Tick intervals in milliseconds
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IntervalsConfig {
    pub update: u64,
    pub ping: u64,
    pub sync: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            update: 30_000,
            ping: 3_000,
            sync: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// Upper bound of blocks fetched when closing a head gap
    #[serde(rename = "maxBlocksHistory")]
    pub max_blocks_history: u64,
    /// Blocks sent for a history request without an explicit list
    #[serde(rename = "maxHistoryUpdate")]
    pub max_history_update: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_blocks_history: 40,
            max_history_update: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    #[serde(rename = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(rename = "attemptsTimeoutMs")]
    pub attempts_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            attempts_timeout_ms: 100_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertingConfig {
    /// Blocks the monitored head may trail the reference head before alerting
    pub threshold: u64,
    /// Every n-th divergent reference block dispatches an alert
    pub every: u64,
    #[serde(rename = "webhookUrl")]
    pub webhook_url: String,
    /// Appended to the alert text, e.g. a Slack user mention
    pub mention: String,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            threshold: 30,
            every: 120,
            webhook_url: String::new(),
            mention: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "0.0.0.0".to_string(),
            port: 9102,
            path: "/metrics".to_string(),
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn block_poll_interval(&self) -> Duration {
        Duration::from_millis(self.block_poll_interval_ms)
    }

    pub fn reference_url(&self) -> Option<&str> {
        if self.reference_url.is_empty() {
            None
        } else {
            Some(&self.reference_url)
        }
    }
}

impl IntervalsConfig {
    pub fn update(&self) -> Duration {
        Duration::from_millis(self.update)
    }

    pub fn ping(&self) -> Duration {
        Duration::from_millis(self.ping)
    }

    pub fn sync(&self) -> Duration {
        Duration::from_millis(self.sync)
    }
}

impl ConnectionConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.attempts_timeout_ms)
    }
}

impl AlertingConfig {
    pub fn webhook_url(&self) -> Option<&str> {
        if self.webhook_url.is_empty() {
            None
        } else {
            Some(&self.webhook_url)
        }
    }
}

impl AppConfig {
    /// Reads a YAML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Environment variables take precedence over the file
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key) {
                *target = value;
            }
        };
        set(&mut self.general.name, "INSTANCE_NAME");
        set(&mut self.general.contact, "CONTACT_DETAILS");
        set(&mut self.general.node_type, "NODE_TYPE");
        set(&mut self.rpc.url, "RPC_HOST");
        set(&mut self.rpc.reference_url, "DEFAULT_RPC_HOST");
        set(&mut self.collector.url, "WS_SERVER");
        set(&mut self.collector.secret, "WS_SECRET");
        set(&mut self.alerting.webhook_url, "SLACK_WEBHOOK_URL");

        if let Some(value) = lookup("ENABLE_HISTORY") {
            self.history.enabled = match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "ENABLE_HISTORY",
                        value,
                    })
                }
            };
        }
        if let Some(value) = lookup("DIFF_BLOCK") {
            self.alerting.threshold = value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "DIFF_BLOCK",
                value: value.clone(),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "general.name (INSTANCE_NAME) must be set".to_string(),
            ));
        }
        if self.rpc.url.is_empty() {
            return Err(ConfigError::Invalid("rpc.url must be set".to_string()));
        }
        if self.collector.url.is_empty() {
            return Err(ConfigError::Invalid("collector.url must be set".to_string()));
        }
        let intervals = [
            ("intervals.update", self.intervals.update),
            ("intervals.ping", self.intervals.ping),
            ("intervals.sync", self.intervals.sync),
            ("rpc.blockPollIntervalMs", self.rpc.block_poll_interval_ms),
            ("collector.timeoutSeconds", self.collector.timeout_seconds),
            ("collector.idleTimeoutSeconds", self.collector.idle_timeout_seconds),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        if self.alerting.every == 0 {
            return Err(ConfigError::Invalid(
                "alerting.every must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_agent() {
        let config = AppConfig::default();
        assert_eq!(config.intervals.update, 30_000);
        assert_eq!(config.intervals.ping, 3_000);
        assert_eq!(config.intervals.sync, 5_000);
        assert_eq!(config.history.max_blocks_history, 40);
        assert_eq!(config.history.max_history_update, 50);
        assert_eq!(config.connection.max_attempts, 50);
        assert_eq!(config.connection.attempts_timeout_ms, 100_000);
        assert_eq!(config.alerting.threshold, 30);
        assert_eq!(config.alerting.every, 120);
        assert!(config.history.enabled);
        assert!(config.rpc.reference_url().is_none());
        assert_eq!(config.collector.url, "ws://localhost:3000");
        assert_eq!(config.collector.idle_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = AppConfig::from_yaml(
            r#"
general:
  name: "My Node"
rpc:
  url: "http://10.0.0.1:8545"
  referenceUrl: "https://bsc-dataseed1.defibit.io"
history:
  maxBlocksHistory: 10
"#,
        )
        .unwrap();
        assert_eq!(config.general.name, "My Node");
        assert_eq!(config.general.node_type, "geth");
        assert_eq!(config.rpc.url, "http://10.0.0.1:8545");
        assert_eq!(
            config.rpc.reference_url(),
            Some("https://bsc-dataseed1.defibit.io")
        );
        assert_eq!(config.history.max_blocks_history, 10);
        assert_eq!(config.history.max_history_update, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("INSTANCE_NAME", "env-node"),
            ("RPC_HOST", "http://rpc:8545"),
            ("WS_SERVER", "wss://stats.example.org"),
            ("ENABLE_HISTORY", "false"),
            ("DIFF_BLOCK", "12"),
            ("SLACK_WEBHOOK_URL", "https://hooks.slack.com/services/x"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.general.name, "env-node");
        assert_eq!(config.rpc.url, "http://rpc:8545");
        assert_eq!(config.collector.url, "wss://stats.example.org");
        assert!(!config.history.enabled);
        assert_eq!(config.alerting.threshold, 12);
        assert!(config.alerting.webhook_url().is_some());
    }

    #[test]
    fn test_invalid_env_value_is_rejected() {
        let mut config = AppConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "DIFF_BLOCK").then(|| "thirty".to_string())
        });
        assert!(matches!(
            result,
            Err(ConfigError::InvalidEnv { key: "DIFF_BLOCK", .. })
        ));
    }

    #[test]
    fn test_validate_requires_name_and_intervals() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_err());

        config.general.name = "node".to_string();
        assert!(config.validate().is_ok());

        config.intervals.ping = 0;
        assert!(config.validate().is_err());

        config.intervals.ping = 3_000;
        config.collector.idle_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "general:\n  name: file-node\nintervals:\n  update: 1000").unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.general.name, "file-node");
        assert_eq!(config.intervals.update(), Duration::from_secs(1));

        assert!(matches!(
            AppConfig::from_file("/definitely/not/here.yaml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
