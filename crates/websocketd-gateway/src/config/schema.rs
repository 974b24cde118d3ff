//! Config schema with strict parsing.
//!
//! `deny_unknown_fields` prevents silent misconfiguration.

use serde::Deserialize;

use websocketd_core::error::{Result, WebsocketdError};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Origin UUID of this installation, stamped on every produced event.
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_file")]
    pub log_file: Option<String>,
    #[serde(default = "default_user")]
    pub user: Option<String>,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default = "default_auth_check_strategy")]
    pub auth_check_strategy: AuthCheckStrategy,
    #[serde(default = "default_auth_check_static_interval")]
    pub auth_check_static_interval: u64,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub websocket: WebsocketSection,
    #[serde(default = "default_process_workers")]
    pub process_workers: ProcessWorkers,
    #[serde(default = "default_worker_connections")]
    pub worker_connections: usize,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        match self.uuid {
            Some(ref uuid) if !uuid.is_empty() => {}
            _ => {
                return Err(WebsocketdError::Internal(
                    "configuration key `uuid` (origin UUID) is required".into(),
                ))
            }
        }
        if let ProcessWorkers::Count(0) = self.process_workers {
            return Err(WebsocketdError::Internal(
                "configuration key `process_workers` must be a positive integer or `auto`".into(),
            ));
        }
        if self.worker_connections == 0 {
            return Err(WebsocketdError::Internal(
                "configuration key `worker_connections` must be a positive integer".into(),
            ));
        }
        Ok(())
    }

    /// Origin UUID, only callable after [`Config::validate`].
    pub fn origin_uuid(&self) -> &str {
        self.uuid.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthCheckStrategy {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ProcessWorkers {
    Count(usize),
    Keyword(ProcessWorkersKeyword),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessWorkersKeyword {
    Auto,
}

impl ProcessWorkers {
    /// Resolve `auto` to the number of schedulable CPUs.
    pub fn resolve(&self) -> usize {
        match self {
            ProcessWorkers::Count(count) => *count,
            ProcessWorkers::Keyword(ProcessWorkersKeyword::Auto) => {
                std::thread::available_parallelism()
                    .map(usize::from)
                    .unwrap_or(1)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    #[serde(default = "default_auth_host")]
    pub host: String,
    #[serde(default = "default_auth_port")]
    pub port: u16,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub https: bool,
    #[serde(default = "default_auth_key_file")]
    pub key_file: String,
    /// Service credentials, normally loaded from `key_file`.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            host: default_auth_host(),
            port: default_auth_port(),
            prefix: None,
            https: false,
            key_file: default_auth_key_file(),
            username: None,
            password: None,
        }
    }
}

impl AuthSection {
    /// Base URL of the identity service.
    pub fn base_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        let prefix = self.prefix.as_deref().unwrap_or_default();
        format!("{scheme}://{}:{}{prefix}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusSection {
    #[serde(default = "default_bus_host")]
    pub host: String,
    #[serde(default = "default_bus_port")]
    pub port: u16,
    #[serde(default = "default_bus_username")]
    pub username: String,
    #[serde(default = "default_bus_password")]
    pub password: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(default = "default_exchange_name")]
    pub exchange_name: String,
    #[serde(default = "default_exchange_type")]
    pub exchange_type: String,
    #[serde(default = "default_consumer_prefetch")]
    pub consumer_prefetch: u16,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            host: default_bus_host(),
            port: default_bus_port(),
            username: default_bus_username(),
            password: default_bus_password(),
            vhost: String::new(),
            exchange_name: default_exchange_name(),
            exchange_type: default_exchange_type(),
            consumer_prefetch: default_consumer_prefetch(),
        }
    }
}

impl BusSection {
    /// AMQP URI, heartbeat pinned at 10 seconds.
    pub fn url(&self) -> String {
        let vhost = if self.vhost.is_empty() { "%2f" } else { &self.vhost };
        format!(
            "amqp://{}:{}@{}:{}/{vhost}?heartbeat=10",
            self.username, self.password, self.host, self.port
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebsocketSection {
    #[serde(default = "default_ws_listen")]
    pub listen: String,
    #[serde(default = "default_ws_port")]
    pub port: u16,
    /// Deprecated; terminate TLS at the reverse proxy instead.
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
}

impl Default for WebsocketSection {
    fn default() -> Self {
        Self {
            listen: default_ws_listen(),
            port: default_ws_port(),
            certificate: None,
            private_key: None,
            ping_interval: default_ping_interval(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_file() -> Option<String> {
    Some("/var/log/wazo-websocketd.log".into())
}

fn default_user() -> Option<String> {
    Some("wazo-websocketd".into())
}

fn default_auth_check_strategy() -> AuthCheckStrategy {
    AuthCheckStrategy::Dynamic
}

fn default_auth_check_static_interval() -> u64 {
    60
}

fn default_process_workers() -> ProcessWorkers {
    ProcessWorkers::Keyword(ProcessWorkersKeyword::Auto)
}

fn default_worker_connections() -> usize {
    1
}

fn default_auth_host() -> String {
    "localhost".into()
}

fn default_auth_port() -> u16 {
    9497
}

fn default_auth_key_file() -> String {
    "/var/lib/wazo-auth-keys/wazo-websocketd-key.yml".into()
}

fn default_bus_host() -> String {
    "localhost".into()
}

fn default_bus_port() -> u16 {
    5672
}

fn default_bus_username() -> String {
    "guest".into()
}

fn default_bus_password() -> String {
    "guest".into()
}

fn default_exchange_name() -> String {
    "wazo-headers".into()
}

fn default_exchange_type() -> String {
    "headers".into()
}

fn default_consumer_prefetch() -> u16 {
    250
}

fn default_ws_listen() -> String {
    "127.0.0.1".into()
}

fn default_ws_port() -> u16 {
    9502
}

fn default_ping_interval() -> u64 {
    60
}
