//! Configuration loading and fail-fast validation.
//!
//! Hierarchical merge, lowest to highest precedence: programmatic
//! defaults, an optional `cadence.yaml` beside the process, then the
//! documented environment variables. Missing or malformed secrets abort
//! startup before anything touches the graph.

use anyhow::{Context, Result};
use figment::providers::{Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::{Config, GraphConfig};

use super::gateway::validate_gateway_url;

/// Minimum length of the gateway bearer token.
pub const MIN_GATEWAY_TOKEN_CHARS: usize = 32;

/// Minimum length of the HMAC master secret.
pub const MIN_HMAC_SECRET_CHARS: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("GRAPH_PASSWORD is required")]
    MissingGraphPassword,

    #[error("GATEWAY_URL is required")]
    MissingGatewayUrl,

    #[error("GATEWAY_TOKEN is required and must be at least {MIN_GATEWAY_TOKEN_CHARS} characters")]
    BadGatewayToken,

    #[error("AGENT_HMAC_SECRET is required and must be at least {MIN_HMAC_SECRET_CHARS} characters")]
    BadHmacSecret,

    #[error("GRAPH_URI scheme not allowed: {0}")]
    ForbiddenGraphScheme(String),

    #[error("GATEWAY_URL must be https, or http on loopback: {0}")]
    ForbiddenGatewayScheme(String),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid cycle interval: {0} minutes")]
    InvalidInterval(u32),
}

/// Configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<Config> {
        Self::load_from(Some("cadence.yaml"))
    }

    pub fn load_from(yaml_path: Option<&str>) -> Result<Config> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = yaml_path {
            figment = figment.merge(Yaml::file(path));
        }
        let mut config: Config = figment
            .extract()
            .context("Failed to extract configuration")?;

        Self::apply_env(&mut config);
        Self::validate(&config)?;
        Ok(config)
    }

    /// Overlay the documented environment variables, highest precedence.
    fn apply_env(config: &mut Config) {
        if let Ok(uri) = std::env::var("GRAPH_URI") {
            config.graph.uri = uri;
        }
        if let Ok(user) = std::env::var("GRAPH_USER") {
            config.graph.user = user;
        }
        if let Ok(password) = std::env::var("GRAPH_PASSWORD") {
            config.graph.password = password;
        }
        if let Ok(url) = std::env::var("GATEWAY_URL") {
            config.gateway.url = url;
        }
        if let Ok(token) = std::env::var("GATEWAY_TOKEN") {
            config.gateway.token = token;
        }
        if let Ok(secret) = std::env::var("AGENT_HMAC_SECRET") {
            config.hmac_secret = secret;
        }
        if let Ok(root) = std::env::var("PROJECT_ROOT") {
            config.project_root = Some(root);
        }
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.graph.password.is_empty() {
            return Err(ConfigError::MissingGraphPassword);
        }

        let scheme = config.graph.uri.split("://").next().unwrap_or("");
        if !GraphConfig::ALLOWED_SCHEMES.contains(&scheme) {
            return Err(ConfigError::ForbiddenGraphScheme(config.graph.uri.clone()));
        }

        if config.gateway.url.is_empty() {
            return Err(ConfigError::MissingGatewayUrl);
        }
        if validate_gateway_url(&config.gateway.url).is_err() {
            return Err(ConfigError::ForbiddenGatewayScheme(
                config.gateway.url.clone(),
            ));
        }

        if config.gateway.token.chars().count() < MIN_GATEWAY_TOKEN_CHARS {
            return Err(ConfigError::BadGatewayToken);
        }
        if config.hmac_secret.chars().count() < MIN_HMAC_SECRET_CHARS {
            return Err(ConfigError::BadHmacSecret);
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.cycle.interval_minutes == 0 || config.cycle.interval_minutes > 60 {
            return Err(ConfigError::InvalidInterval(config.cycle.interval_minutes));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.graph.password = "secret".to_string();
        config.gateway.url = "https://gateway.example".to_string();
        config.gateway.token = "t".repeat(MIN_GATEWAY_TOKEN_CHARS);
        config.hmac_secret = "s".repeat(MIN_HMAC_SECRET_CHARS);
        config
    }

    #[test]
    fn test_valid_config_passes() {
        ConfigLoader::validate(&valid_config()).expect("valid config");
    }

    #[test]
    fn test_missing_password_fails() {
        let mut config = valid_config();
        config.graph.password.clear();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::MissingGraphPassword)
        ));
    }

    #[test]
    fn test_graph_scheme_rejected() {
        let mut config = valid_config();
        config.graph.uri = "http://localhost:7474".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ForbiddenGraphScheme(_))
        ));
    }

    #[test]
    fn test_short_token_rejected() {
        let mut config = valid_config();
        config.gateway.token = "short".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::BadGatewayToken)
        ));
    }

    #[test]
    fn test_short_secret_rejected() {
        let mut config = valid_config();
        config.hmac_secret = "short".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::BadHmacSecret)
        ));
    }

    #[test]
    fn test_non_loopback_http_gateway_rejected() {
        let mut config = valid_config();
        config.gateway.url = "http://gateway.example".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ForbiddenGatewayScheme(_))
        ));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut config = valid_config();
        config.logging.level = "loud".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }
}
