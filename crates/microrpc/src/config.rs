//! File and environment configuration for clients and servers.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use microrpc_codec::DEFAULT_CONTENT_TYPE;
use microrpc_transport::pool::{DEFAULT_POOL_SIZE, DEFAULT_POOL_TTL};
use microrpc_transport::transport::DEFAULT_DIAL_TIMEOUT;

use crate::client::options::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRIES};

/// Environment variable overriding [`ClientConfig::content_type`].
pub const ENV_CONTENT_TYPE: &str = "MICRORPC_CONTENT_TYPE";
/// Environment variable overriding [`ClientConfig::pool_size`].
pub const ENV_POOL_SIZE: &str = "MICRORPC_POOL_SIZE";
/// Environment variable overriding [`ClientConfig::pool_ttl_ms`].
pub const ENV_POOL_TTL_MS: &str = "MICRORPC_POOL_TTL_MS";
/// Environment variable overriding [`ClientConfig::retries`].
pub const ENV_RETRIES: &str = "MICRORPC_RETRIES";
/// Environment variable overriding [`ClientConfig::request_timeout_ms`].
pub const ENV_REQUEST_TIMEOUT_MS: &str = "MICRORPC_REQUEST_TIMEOUT_MS";
/// Environment variable overriding [`ServerConfig::address`].
pub const ENV_SERVER_ADDRESS: &str = "MICRORPC_SERVER_ADDRESS";

/// Client tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub content_type: String,
    pub pool_size: usize,
    pub pool_ttl_ms: u64,
    pub retries: u32,
    pub request_timeout_ms: u64,
    pub dial_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            pool_ttl_ms: DEFAULT_POOL_TTL.as_millis() as u64,
            retries: DEFAULT_RETRIES,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ClientConfig {
    pub fn pool_ttl(&self) -> Duration {
        Duration::from_millis(self.pool_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// Server identity and bind address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub address: String,
    pub metadata: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: crate::server::options::DEFAULT_NAME.to_string(),
            version: crate::server::options::DEFAULT_VERSION.to_string(),
            address: crate::server::options::DEFAULT_ADDRESS.to_string(),
            metadata: HashMap::new(),
        }
    }
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl RpcConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Applies `MICRORPC_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup; unset keys are skipped.
    pub fn apply_vars<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_CONTENT_TYPE) {
            self.client.content_type = v;
        }
        if let Some(v) = lookup(ENV_POOL_SIZE) {
            self.client.pool_size = parse_var(ENV_POOL_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_POOL_TTL_MS) {
            self.client.pool_ttl_ms = parse_var(ENV_POOL_TTL_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_RETRIES) {
            self.client.retries = parse_var(ENV_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            self.client.request_timeout_ms = parse_var(ENV_REQUEST_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_SERVER_ADDRESS) {
            self.server.address = v;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid value {:?} for {}", value, key))
}
