//! Configuration system for the MQTT connection pool
//!
//! Every section is optional; an empty file yields a pool with no startup
//! brokers and the default reconnection policy.

use crate::broker::{Broker, Credentials};
use crate::pool::BackoffPolicy;
use crate::transport::TransportSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Environment variable overriding `[server] port`
pub const CONTROL_PORT_ENV: &str = "CONTROL_PORT";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub transport: TransportSection,
    /// Brokers registered and connected at startup
    #[serde(default)]
    pub brokers: Vec<BrokerSection>,
}

/// Control server section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_control_port() -> u16 {
    8080
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_control_port(),
        }
    }
}

/// Backoff policy constants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_exponent")]
    pub max_exponent: u32,
    /// Give up after this many seconds without a successful reconnect
    #[serde(default = "default_max_recovery_window_secs")]
    pub max_recovery_window_secs: u64,
}

fn default_base_delay_secs() -> u64 {
    1
}

fn default_max_exponent() -> u32 {
    8
}

fn default_max_recovery_window_secs() -> u64 {
    600 // 10 minutes
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_exponent: default_max_exponent(),
            max_recovery_window_secs: default_max_recovery_window_secs(),
        }
    }
}

impl ReconnectSection {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_secs(self.base_delay_secs),
            max_exponent: self.max_exponent,
            max_recovery_window: Duration::from_secs(self.max_recovery_window_secs),
        }
    }
}

/// Transport tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keep_alive_secs() -> u64 {
    60
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl TransportSection {
    pub fn settings(&self) -> TransportSettings {
        TransportSettings {
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

/// A broker connected at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Fixed broker id; a random one is generated when absent
    pub id: Option<Uuid>,
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default)]
    pub login: String,
    /// Inline password; never written back out
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

fn default_broker_port() -> u16 {
    1883
}

impl BrokerSection {
    /// Build the broker record, resolving `password_env` at call time
    pub fn to_broker(&self) -> Result<Broker, ConfigError> {
        let password = match (&self.password_env, &self.password) {
            (Some(name), _) => get_env_var_required(name)?,
            (None, Some(password)) => password.clone(),
            (None, None) => String::new(),
        };

        let credentials = Credentials::new(self.login.clone(), password);
        Ok(match self.id {
            Some(id) => Broker::with_id(id, self.host.clone(), self.port, credentials),
            None => Broker::new(self.host.clone(), self.port, credentials),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "server.port must be greater than 0".to_string(),
            ));
        }

        self.reconnect
            .policy()
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("reconnect: {e}")))?;

        if self.transport.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "transport.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        for (index, broker) in self.brokers.iter().enumerate() {
            if broker.host.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "brokers[{index}].host must not be empty"
                )));
            }
            if broker.port == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "brokers[{index}].port must be greater than 0"
                )));
            }
            if broker.password.is_some() && broker.password_env.is_some() {
                return Err(ConfigError::InvalidConfig(format!(
                    "brokers[{index}] sets both password and password_env"
                )));
            }
        }

        Ok(())
    }

    /// Apply `CONTROL_PORT` if set
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var(CONTROL_PORT_ENV) {
            self.server.port = port.parse().map_err(|_| {
                ConfigError::InvalidConfig(format!("{CONTROL_PORT_ENV} is not a valid port: {port}"))
            })?;
        }
        Ok(())
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[server]
bind = "127.0.0.1"
port = 9000

[reconnect]
base_delay_secs = 2
max_exponent = 6
max_recovery_window_secs = 120

[transport]
connect_timeout_secs = 5
keep_alive_secs = 30

[[brokers]]
host = "mqtt.local"
login = "sensor"
password = "secret"
topics = ["sensors/#", "alerts"]

[[brokers]]
id = "6f1c1f0e-8a4e-4d2b-9a57-2f1f5b7c9d10"
host = "backup.local"
port = 8883
"#;

        let config = AppConfig::from_toml(toml_content).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.reconnect.policy().base_delay, Duration::from_secs(2));
        assert_eq!(config.reconnect.policy().max_exponent, 6);
        assert_eq!(
            config.transport.settings().connect_timeout,
            Duration::from_secs(5)
        );
        assert_eq!(config.brokers.len(), 2);
        assert_eq!(config.brokers[0].port, 1883);
        assert_eq!(config.brokers[0].topics, vec!["sensors/#", "alerts"]);
        assert_eq!(config.brokers[1].port, 8883);
        assert!(config.brokers[1].id.is_some());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();

        assert_eq!(config, AppConfig::default());
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.reconnect.policy(), BackoffPolicy::default());
        assert_eq!(config.transport.settings(), TransportSettings::default());
        assert!(config.brokers.is_empty());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            "[server]\nport = 0",
            "[reconnect]\nbase_delay_secs = 0",
            "[reconnect]\nmax_recovery_window_secs = 0",
            "[transport]\nconnect_timeout_secs = 0",
            "[[brokers]]\nhost = \"\"",
            "[[brokers]]\nhost = \"h\"\nport = 0",
            "[[brokers]]\nhost = \"h\"\npassword = \"a\"\npassword_env = \"B\"",
        ];

        for case in cases {
            let result = AppConfig::from_toml(case);
            assert!(
                matches!(result, Err(ConfigError::InvalidConfig(_))),
                "expected rejection for {case:?}"
            );
        }
    }

    #[test]
    fn test_malformed_toml() {
        let result = AppConfig::from_toml("[server\nport = ");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_broker_section_to_broker() {
        let section = BrokerSection {
            id: None,
            host: "mqtt.local".to_string(),
            port: 1884,
            login: "user".to_string(),
            password: Some("pw".to_string()),
            password_env: None,
            topics: vec![],
        };

        let broker = section.to_broker().unwrap();
        assert_eq!(broker.address(), "mqtt.local:1884");
        assert_eq!(broker.credentials.login, "user");
        assert_eq!(broker.credentials.password, "pw");
    }

    #[test]
    fn test_broker_password_from_env() {
        std::env::set_var("MQTT_POOL_TEST_BROKER_PASSWORD", "from-env");
        let section = BrokerSection {
            id: Some(Uuid::nil()),
            host: "h".to_string(),
            port: 1883,
            login: "u".to_string(),
            password: None,
            password_env: Some("MQTT_POOL_TEST_BROKER_PASSWORD".to_string()),
            topics: vec![],
        };

        let broker = section.to_broker().unwrap();
        assert_eq!(broker.id, Uuid::nil());
        assert_eq!(broker.credentials.password, "from-env");

        let missing = BrokerSection {
            password_env: Some("MQTT_POOL_TEST_MISSING_VAR".to_string()),
            ..section
        };
        assert!(matches!(
            missing.to_broker(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_password_not_serialized() {
        let config = AppConfig::from_toml(
            "[[brokers]]\nhost = \"h\"\nlogin = \"u\"\npassword = \"hunter2\"",
        )
        .unwrap();

        let shown = toml::to_string(&config).unwrap();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("login = \"u\""));
    }
}
