//! WolfElect Configuration
//!
//! This module provides configuration structures for the election daemon
//! and the coordination server it can run.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::client::Endpoint;
use crate::network::SessionOptions;
use crate::store::path;

/// Main WolfElect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectConfig {
    /// Participant identity
    pub node: NodeConfig,

    /// Coordination store connection
    pub coordination: CoordinationConfig,

    /// Election parameters
    #[serde(default)]
    pub election: ElectionConfig,

    /// Coordination server (used by `wolfelect serve`)
    #[serde(default)]
    pub server: ServerConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Participant identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Participant id published as the data of the election node
    pub id: String,
}

/// Coordination store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Endpoint URL, `zk://host:port[,host:port][/path]`
    pub url: String,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Per-host connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long closing the connection waits for elections to withdraw
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Election path (defaults to the path of the coordination URL)
    #[serde(default)]
    pub path: Option<String>,

    /// Upper bound on presenting unconfirmed leadership, in milliseconds
    #[serde(default = "default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,

    /// Transitions buffered for a slow consumer
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

/// Coordination server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the coordination server listens on
    #[serde(default = "default_server_address")]
    pub bind_address: String,

    /// Session reaper interval in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_close_grace_ms() -> u64 {
    5_000
}

fn default_stale_timeout_ms() -> u64 {
    10_000
}

fn default_buffer() -> usize {
    crate::election::DEFAULT_BUFFER
}

fn default_server_address() -> String {
    "0.0.0.0:2181".to_string()
}

fn default_tick_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            path: None,
            stale_timeout_ms: default_stale_timeout_ms(),
            buffer: default_buffer(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_server_address(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ElectConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ElectConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        let endpoint = Endpoint::parse(&self.coordination.url)?;
        if self.coordination.session_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "coordination.session_timeout_ms must be positive".into(),
            ));
        }
        if self.coordination.connect_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "coordination.connect_timeout_ms must be positive".into(),
            ));
        }

        match self.election.path.as_deref().or(endpoint.path.as_deref()) {
            None => {
                return Err(crate::Error::Config(
                    "election.path is not set and coordination.url has no path".into(),
                ))
            }
            Some("/") => {
                return Err(crate::Error::Config("election.path cannot be the root".into()))
            }
            Some(p) => path::validate(p)
                .map_err(|e| crate::Error::Config(format!("election.path: {}", e)))?,
        }
        if self.election.stale_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "election.stale_timeout_ms must be positive".into(),
            ));
        }
        if self.election.buffer == 0 {
            return Err(crate::Error::Config("election.buffer must be at least 1".into()));
        }

        if self.server.tick_ms == 0 {
            return Err(crate::Error::Config("server.tick_ms must be positive".into()));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "compact") {
            return Err(crate::Error::Config(format!(
                "logging.format must be pretty or compact, got '{}'",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Get the election path, falling back to the coordination URL's path
    pub fn election_path(&self) -> crate::Result<String> {
        if let Some(path) = &self.election.path {
            return Ok(path.clone());
        }
        Endpoint::parse(&self.coordination.url)?
            .path
            .ok_or_else(|| crate::Error::Config("no election path configured".into()))
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.session_timeout_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.connect_timeout_ms)
    }

    /// Get close grace period as Duration
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.coordination.close_grace_ms)
    }

    /// Get stale timeout as Duration
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.election.stale_timeout_ms)
    }

    /// Get server reaper tick as Duration
    pub fn server_tick(&self) -> Duration {
        Duration::from_millis(self.server.tick_ms)
    }

    /// Session options for connecting to the coordination store
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            session_timeout: self.session_timeout(),
            connect_timeout: self.connect_timeout(),
            auth: Vec::new(),
            close_grace: self.close_grace(),
        }
    }

    /// Render a commented sample configuration
    pub fn sample(node_id: &str) -> String {
        format!(
            r#"# WolfElect Configuration
# Generated configuration file

[node]
id = "{node_id}"

[coordination]
url = "zk://127.0.0.1:2181/services/leader"
# url = "zk://zk-1:2181,zk-2:2181,zk-3:2181/services/leader"
session_timeout_ms = {session}
connect_timeout_ms = {connect}
close_grace_ms = {grace}

[election]
# path = "/services/leader"
stale_timeout_ms = {stale}
buffer = {buffer}

[server]
bind_address = "{server}"
tick_ms = {tick}

[api]
enabled = true
bind_address = "{api}"

[logging]
level = "info"
format = "pretty"
"#,
            session = default_session_timeout_ms(),
            connect = default_connect_timeout_ms(),
            grace = default_close_grace_ms(),
            stale = default_stale_timeout_ms(),
            buffer = default_buffer(),
            server = default_server_address(),
            tick = default_tick_ms(),
            api = default_api_address(),
        )
    }
}
