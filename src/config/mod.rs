//! Configuration management.
//!
//! Static boot configuration (entry points, providers, observability) is
//! loaded once from TOML with environment variable expansion and validated
//! before any listener binds. Dynamic configuration (routers, middlewares,
//! services, transports, TLS material) arrives continuously from providers
//! and is modelled in [`dynamic`]; the annotated, build-time view lives in
//! [`runtime`].

pub mod dynamic;
pub mod runtime;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{info, warn};

pub use dynamic::DynamicConfig;
pub use runtime::RuntimeConfig;

/// Default debounce window for provider messages, in milliseconds.
pub const DEFAULT_THROTTLE_MS: u64 = 2_000;

/// Default grace period for draining a superseded generation, in seconds.
pub const DEFAULT_GRACEFUL_TIMEOUT_SECS: u64 = 10;

/// Fluxgate static boot configuration.
///
/// Everything here is fixed for the lifetime of the process; changing it
/// requires a restart. The dynamic routing table is delivered separately
/// by the configured providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticConfig {
    /// Named listeners accepting inbound traffic
    pub entry_points: HashMap<String, EntryPointConfig>,
    /// Dynamic configuration sources
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Access log sink (JSON lines), reopened on SIGUSR1
    #[serde(default)]
    pub access_log: Option<AccessLogConfig>,
    /// Prometheus metrics exposition
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    /// Read-only JSON API (`api@internal` service)
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

/// A named listener: address, protocol, timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPointConfig {
    /// Bind address, e.g. "0.0.0.0:443"
    pub address: SocketAddr,
    /// Transport protocol for the listener
    #[serde(default)]
    pub protocol: EntryPointProtocol,
    /// Accept h2c (HTTP/2 over cleartext) on this entry point
    #[serde(default)]
    pub h2c: bool,
    /// Client IPs (or CIDR prefixes) trusted to set X-Forwarded-*
    /// headers; an empty list trusts every client
    #[serde(default)]
    pub forwarded_headers_trusted_ips: Vec<String>,
    /// Timeout for reading a request's headers, seconds (0 falls back
    /// to the idle timeout)
    #[serde(default)]
    pub read_timeout: u64,
    /// Idle timeout for keep-alive connections, seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Grace period for draining a superseded generation, seconds
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout: u64,
    /// Idle timeout for UDP sessions, seconds
    #[serde(default = "default_udp_session_timeout")]
    pub udp_session_timeout: u64,
}

fn default_idle_timeout() -> u64 {
    180
}

fn default_graceful_timeout() -> u64 {
    DEFAULT_GRACEFUL_TIMEOUT_SECS
}

fn default_udp_session_timeout() -> u64 {
    30
}

impl EntryPointConfig {
    /// Effective HTTP header-read timeout. This also bounds keep-alive
    /// idle waits, since the next request's headers are what an idle
    /// connection is waiting for.
    pub fn http_header_timeout(&self) -> Option<std::time::Duration> {
        if self.read_timeout > 0 {
            Some(std::time::Duration::from_secs(self.read_timeout))
        } else if self.idle_timeout > 0 {
            Some(std::time::Duration::from_secs(self.idle_timeout))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPointProtocol {
    #[default]
    Tcp,
    Udp,
}

/// Provider pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Debounce window for provider messages, milliseconds
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    /// File provider: parse a dynamic configuration file, re-parse on change
    #[serde(default)]
    pub file: Option<FileProviderConfig>,
    /// HTTP provider: poll an endpoint serving dynamic configuration
    #[serde(default)]
    pub http: Option<HttpProviderConfig>,
}

fn default_throttle_ms() -> u64 {
    DEFAULT_THROTTLE_MS
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            throttle_ms: DEFAULT_THROTTLE_MS,
            file: None,
            http: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProviderConfig {
    /// Path to the dynamic configuration file (TOML)
    pub path: String,
    /// Watch the file and re-deliver on change
    #[serde(default = "default_true")]
    pub watch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    /// Endpoint serving the dynamic configuration as JSON
    pub endpoint: String,
    /// Poll interval, seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogConfig {
    /// Path of the JSON-lines access log file
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Bind address of the Prometheus exposition endpoint
    pub bind: SocketAddr,
    /// Emit per-entry-point metrics
    #[serde(default = "default_true")]
    pub entry_points: bool,
    /// Emit per-router metrics
    #[serde(default)]
    pub routers: bool,
    /// Emit per-service metrics
    #[serde(default = "default_true")]
    pub services: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl StaticConfig {
    /// Load configuration from file with environment variable expansion
    pub async fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let expanded = expand_env_vars(&content);

        let config: StaticConfig = toml::from_str(&expanded)?;
        config.validate()?;

        info!("Configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Validate the static configuration. Errors here are fatal: the
    /// process must not start with an unusable listener set.
    pub fn validate(&self) -> Result<()> {
        if self.entry_points.is_empty() {
            return Err(anyhow::anyhow!("at least one entry point is required"));
        }

        let mut seen_addrs: HashMap<(SocketAddr, EntryPointProtocol), &str> = HashMap::new();
        for (name, ep) in &self.entry_points {
            if name.is_empty() {
                return Err(anyhow::anyhow!("entry point name cannot be empty"));
            }
            if name.contains('@') {
                return Err(anyhow::anyhow!(
                    "entry point name '{}' must not contain '@'",
                    name
                ));
            }
            if let Some(other) = seen_addrs.insert((ep.address, ep.protocol), name) {
                return Err(anyhow::anyhow!(
                    "entry points '{}' and '{}' bind the same address {}",
                    other,
                    name,
                    ep.address
                ));
            }
            if ep.graceful_timeout == 0 {
                return Err(anyhow::anyhow!(
                    "entry point '{}': graceful_timeout must be greater than 0",
                    name
                ));
            }
        }

        Self::validate_providers(&self.providers)?;

        Ok(())
    }

    fn validate_providers(providers: &ProvidersConfig) -> Result<()> {
        if providers.file.is_none() && providers.http.is_none() {
            warn!("No providers configured; the routing table will stay empty");
        }

        if let Some(file) = &providers.file {
            if file.path.is_empty() {
                return Err(anyhow::anyhow!("file provider path cannot be empty"));
            }
        }

        if let Some(http) = &providers.http {
            if http.poll_interval == 0 {
                return Err(anyhow::anyhow!(
                    "http provider poll_interval must be greater than 0"
                ));
            }
        }

        Ok(())
    }

    /// Names of TCP entry points (also carry HTTP traffic).
    pub fn tcp_entry_points(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entry_points
            .iter()
            .filter(|(_, ep)| ep.protocol == EntryPointProtocol::Tcp)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Names of UDP entry points.
    pub fn udp_entry_points(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entry_points
            .iter()
            .filter(|(_, ep)| ep.protocol == EntryPointProtocol::Udp)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Expand environment variables in configuration content
/// Supports ${VAR} and ${VAR:-default} syntax
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_expr = &result[start + 2..start + end];
            let replacement = if let Some(default_pos) = var_expr.find(":-") {
                let var_name = &var_expr[..default_pos];
                let default_value = &var_expr[default_pos + 2..];
                env::var(var_name).unwrap_or_else(|_| default_value.to_string())
            } else {
                env::var(var_expr).unwrap_or_else(|_| {
                    warn!(
                        "Environment variable '{}' not found, using empty string",
                        var_expr
                    );
                    String::new()
                })
            };

            result.replace_range(start..start + end + 1, &replacement);
        } else {
            break; // malformed ${VAR expression
        }
    }

    result
}
