//! Configuration management for the broker server.

use radio_core::BrokerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for the broker server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server configuration
    pub http: HttpConfig,

    /// Broker core configuration
    pub broker: BrokerConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Port to bind to
    pub port: u16,

    /// Address to bind to
    pub bind_address: String,

    /// Largest accepted request body in bytes (binary results can be large)
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig {
                port: 8000,
                bind_address: "127.0.0.1".to_string(),
                max_body_bytes: 32 * 1024 * 1024,
            },
            broker: BrokerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file, with `RADIO_` environment overrides
    /// (e.g. `RADIO_HTTP__PORT=9000`)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("RADIO")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.http.port == 0 {
            return Err(anyhow::anyhow!("HTTP port must be greater than 0"));
        }

        if self.http.bind_address.trim().is_empty() {
            return Err(anyhow::anyhow!("Bind address must be set"));
        }

        if self.http.max_body_bytes == 0 {
            return Err(anyhow::anyhow!("max_body_bytes must be greater than 0"));
        }

        self.broker
            .validate()
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        Ok(())
    }
}
