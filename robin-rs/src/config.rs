use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub hostname: String,
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub smtp_port: u16,
    pub secure_port: u16,
    pub submission_port: u16,
    pub backlog: u32,
    pub minimum_pool_size: usize,
    pub maximum_pool_size: usize,
    pub thread_keep_alive_time: u64,
    pub transactions_limit: usize,
    pub error_limit: usize,
    pub read_timeout_secs: u64,
    pub auth: bool,
    /// Unix socket of a Dovecot auth service; when unset, the static
    /// `users` table is the credential backend.
    pub auth_socket: Option<String>,
    pub starttls: bool,
    pub chunking: bool,
    pub size_limit: Option<usize>,
    pub keystore: Option<String>,
    pub keystore_password: Option<String>,
    pub relay: bool,
    pub relay_host: Option<String>,
    pub users: Vec<UserConfig>,
    pub scenarios: HashMap<String, ScenarioConfig>,
}

/// One entry in the static credential table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
}

/// Canned-response scenario, selected by the client's greeting identity.
///
/// Exactly one of `helo`/`lhlo`/`ehlo` is expected as the match key; the
/// override fields replace the default replies for the matching session.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub helo: Option<String>,
    pub lhlo: Option<String>,
    pub ehlo: Option<String>,
    pub starttls: Option<String>,
    pub mail: Option<String>,
    pub rcpt: Vec<RcptOverride>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RcptOverride {
    pub value: String,
    pub response: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "robin.localhost".to_string(),
            bind: "0.0.0.0".to_string(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            smtp_port: 25,
            secure_port: 465,
            submission_port: 587,
            backlog: 25,
            minimum_pool_size: 1,
            maximum_pool_size: 16,
            thread_keep_alive_time: 60,
            transactions_limit: 200,
            error_limit: 3,
            read_timeout_secs: 300,
            auth: false,
            auth_socket: None,
            starttls: false,
            chunking: false,
            size_limit: None,
            keystore: None,
            keystore_password: None,
            relay: false,
            relay_host: None,
            users: Vec::new(),
            scenarios: HashMap::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "/tmp/robin-mail".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Every option name the loader understands, used to warn on unknown keys
/// at startup instead of failing or silently ignoring them.
const KNOWN_SECTIONS: &[&str] = &["server", "smtp", "storage", "logging"];

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::RobinError::Config(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: toml::Value = content
            .parse()
            .map_err(|e: toml::de::Error| crate::error::RobinError::Config(e.to_string()))?;

        if let Some(table) = raw.as_table() {
            for key in table.keys() {
                if !KNOWN_SECTIONS.contains(&key.as_str()) {
                    tracing::warn!("Unknown configuration section: {}", key);
                }
            }
        }

        raw.try_into()
            .map_err(|e: toml::de::Error| crate::error::RobinError::Config(e.to_string()))
    }
}
