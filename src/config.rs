//! Configuration management for the Finsync server

use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub sync: SyncConfig,
    pub database: DatabaseConfig,
}

/// Control-plane HTTP listener. Loopback by default: it hands out the live
/// pairing token.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Browser origins allowed to call the control plane (operator UI)
    pub allowed_origins: Vec<String>,
}

/// WebSocket sync listener and pairing token policy
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub host: String,
    pub port: u16,
    /// Address advertised to joining devices. Detected when unset.
    pub public_host: Option<String>,
    pub token_ttl_secs: u64,
    pub rotation_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                allowed_origins: Vec::new(),
            },
            sync: SyncConfig {
                host: "0.0.0.0".to_string(),
                port: 8765,
                public_host: None,
                token_ttl_secs: 300,
                rotation_interval_secs: 240,
            },
            database: DatabaseConfig {
                url: "sqlite:./finsync.db".to_string(),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: parse_var("SERVER_PORT", 3000)?,
                allowed_origins: env::var("CONTROL_ALLOWED_ORIGINS")
                    .map(|v| parse_list(&v))
                    .unwrap_or_default(),
            },
            sync: SyncConfig {
                host: env::var("SYNC_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SYNC_PORT", 8765)?,
                public_host: env::var("SYNC_PUBLIC_HOST").ok().filter(|h| !h.is_empty()),
                token_ttl_secs: parse_var("PAIRING_TOKEN_TTL_SECS", 300)?,
                rotation_interval_secs: parse_var("PAIRING_ROTATION_SECS", 240)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./finsync.db".to_string()),
            },
        };

        Ok(config.normalized())
    }

    /// Enforce that auto-rotation fires strictly before the token expires.
    pub fn normalized(mut self) -> Self {
        let ttl = self.sync.token_ttl_secs.max(2);
        if self.sync.token_ttl_secs != ttl {
            tracing::warn!("Pairing token TTL raised to {}s", ttl);
            self.sync.token_ttl_secs = ttl;
        }

        let rotation = self.sync.rotation_interval_secs;
        if rotation == 0 || rotation >= ttl {
            let clamped = ttl - 1;
            tracing::warn!(
                "Pairing rotation interval {}s must be shorter than TTL {}s, using {}s",
                rotation,
                ttl,
                clamped
            );
            self.sync.rotation_interval_secs = clamped;
        }

        self
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rotation_is_shorter_than_ttl() {
        let config = Config::default();
        assert!(config.sync.rotation_interval_secs < config.sync.token_ttl_secs);
        assert_ne!(config.server.port, config.sync.port);
    }

    #[test]
    fn test_control_plane_defaults_to_loopback() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.server.allowed_origins.is_empty());
        assert_eq!(config.sync.host, "0.0.0.0");
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            parse_list(" http://localhost:5173, ,app://finsync "),
            vec!["http://localhost:5173".to_string(), "app://finsync".to_string()]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_normalized_clamps_rotation() {
        let mut config = Config::default();
        config.sync.token_ttl_secs = 60;
        config.sync.rotation_interval_secs = 90;

        let config = config.normalized();
        assert_eq!(config.sync.rotation_interval_secs, 59);
    }

    #[test]
    fn test_normalized_rejects_zero_rotation() {
        let mut config = Config::default();
        config.sync.rotation_interval_secs = 0;

        let config = config.normalized();
        assert_eq!(config.sync.rotation_interval_secs, 299);
    }

    #[test]
    fn test_normalized_keeps_valid_values() {
        let config = Config::default().normalized();
        assert_eq!(config.sync.token_ttl_secs, 300);
        assert_eq!(config.sync.rotation_interval_secs, 240);
    }
}
