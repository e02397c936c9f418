use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum simultaneous connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Messages allowed per rolling minute per connection
    #[serde(default = "default_message_rate_limit")]
    pub message_rate_limit: u32,
    /// Seconds a connection may stay unauthenticated before being closed
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Enable the x402 micropayment request/receipt exchange
    #[serde(default = "default_true")]
    pub enable_x402: bool,
    /// Enable coalition formation methods
    #[serde(default = "default_true")]
    pub enable_coalitions: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9040
}

fn default_max_connections() -> usize {
    500
}

fn default_message_rate_limit() -> u32 {
    120
}

fn default_auth_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            message_rate_limit: default_message_rate_limit(),
            auth_timeout_secs: default_auth_timeout_secs(),
            enable_x402: true,
            enable_coalitions: true,
        }
    }
}

/// On-chain agent registry adapter settings
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RegistryConfig {
    /// Base URL of the registry HTTP gateway. None disables external lookups.
    #[serde(default)]
    pub url: Option<String>,
    /// Request timeout in milliseconds
    #[serde(default = "default_registry_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_registry_timeout_ms() -> u64 {
    5000
}

/// Market data fan-out settings
#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    /// Seconds between provider polls for subscribed markets
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 9040)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PARLEY_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (PARLEY_SERVER__PORT, etc.)
            .add_source(
                Environment::with_prefix("PARLEY")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.max_connections == 0 {
            errors.push("server.max_connections must be positive".to_string());
        }

        if self.server.message_rate_limit == 0 {
            errors.push("server.message_rate_limit must be positive".to_string());
        }

        if self.server.auth_timeout_secs == 0 {
            errors.push("server.auth_timeout_secs must be positive".to_string());
        }

        if let Some(url) = &self.registry.url {
            if url::Url::parse(url).is_err() {
                errors.push(format!("registry.url is not a valid URL: {url}"));
            }
        }

        if self.market_data.poll_interval_secs == 0 {
            errors.push("market_data.poll_interval_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig {
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            market_data: MarketDataConfig::default(),
            logging: LoggingConfig::default(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_registry_url_rejected() {
        let config = AppConfig {
            server: ServerConfig::default(),
            registry: RegistryConfig {
                url: Some("not a url".to_string()),
                timeout_ms: 5000,
            },
            market_data: MarketDataConfig::default(),
            logging: LoggingConfig::default(),
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("registry.url")));
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let config = AppConfig {
            server: ServerConfig {
                message_rate_limit: 0,
                ..ServerConfig::default()
            },
            registry: RegistryConfig::default(),
            market_data: MarketDataConfig::default(),
            logging: LoggingConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
