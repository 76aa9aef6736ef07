//! Runtime configuration model.
//!
//! Populated by the loader in `infrastructure::config` from defaults, an
//! optional `cadence.yaml`, and the documented environment variables.
//! Secrets are required and validated fail-fast at startup.

use serde::{Deserialize, Serialize};

/// Graph endpoint settings. `GRAPH_URI` / `GRAPH_USER` / `GRAPH_PASSWORD`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    /// Required; startup fails if empty.
    #[serde(default)]
    pub password: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: String::new(),
            request_timeout_secs: 10,
        }
    }
}

impl GraphConfig {
    /// Accepted URI schemes for the graph endpoint.
    pub const ALLOWED_SCHEMES: [&'static str; 4] = ["bolt", "bolt+s", "neo4j", "neo4j+s"];
}

/// Agent gateway settings. `GATEWAY_URL` / `GATEWAY_TOKEN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    /// Delegation dispatch timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            request_timeout_secs: 15,
        }
    }
}

/// Cycle runner knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Cadence of the master clock, in minutes. Fixed at 5 in production;
    /// overridable only so tests can compress time.
    pub interval_minutes: u32,
    /// Cumulative token cap per cycle.
    pub token_cap: u64,
    /// Default handler timeout when the registry entry does not set one.
    pub default_timeout_secs: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
            token_cap: 8_650,
            default_timeout_secs: 60,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
    /// Optional directory for rotated file output.
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            log_dir: None,
        }
    }
}

/// Bind settings for the operational HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8700".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// `AGENT_HMAC_SECRET`; ≥ 64 chars, used to derive per-agent keys.
    #[serde(default)]
    pub hmac_secret: String,
    /// `PROJECT_ROOT`; defaults to the working directory.
    #[serde(default)]
    pub project_root: Option<String>,
}
