use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for graftlink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Outbound transport.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// DNS hijacking settings.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Redirector timeouts.
    #[serde(default)]
    pub redirect: RedirectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level used when `-v` is not given.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Leave UDP (except DNS) untouched.
    #[serde(default)]
    pub no_udp: bool,

    /// Probe the upstream before starting the command.
    #[serde(default = "default_true")]
    pub test_upstream: bool,

    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,

    /// URL fetched through the upstream by the connectivity probe.
    #[serde(default = "default_test_url")]
    pub test_url: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            no_udp: false,
            test_upstream: true,
            test_timeout_secs: default_test_timeout(),
            test_url: default_test_url(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_true() -> bool {
    true
}

fn default_test_timeout() -> u64 {
    10
}

fn default_test_url() -> String {
    "http://www.gstatic.com/generate_204".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamProtocol {
    Direct,
    Socks5,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_protocol")]
    pub protocol: UpstreamProtocol,

    /// `host:port` of the proxy server.
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub auth: Option<UpstreamAuth>,

    /// Whether the upstream can carry UDP.
    #[serde(default = "default_true")]
    pub udp: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            address: Some("127.0.0.1:1080".to_string()),
            auth: None,
            udp: true,
        }
    }
}

fn default_protocol() -> UpstreamProtocol {
    UpstreamProtocol::Socks5
}

impl UpstreamConfig {
    /// Parse `direct` or `socks5://host:port`.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        if url == "direct" {
            return Ok(Self {
                protocol: UpstreamProtocol::Direct,
                address: None,
                auth: None,
                udp: true,
            });
        }
        let address = url
            .strip_prefix("socks5://")
            .ok_or_else(|| ConfigError::Invalid(format!("unsupported upstream: {}", url)))?
            .trim_end_matches('/');
        if !address.contains(':') {
            return Err(ConfigError::Invalid(format!("missing port in upstream: {}", url)));
        }
        Ok(Self {
            protocol: UpstreamProtocol::Socks5,
            address: Some(address.to_string()),
            auth: None,
            udp: true,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Resolver queried in the background to learn real addresses.
    #[serde(default = "default_resolver")]
    pub real_resolver: SocketAddr,

    /// Resolver that receives queries which are not hijacked.
    #[serde(default = "default_resolver")]
    pub fallback_resolver: SocketAddr,

    /// TTL of hijacked answers, in seconds.
    #[serde(default = "default_hijack_ttl")]
    pub hijack_ttl: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            real_resolver: default_resolver(),
            fallback_resolver: default_resolver(),
            hijack_ttl: default_hijack_ttl(),
        }
    }
}

fn default_resolver() -> SocketAddr {
    SocketAddr::from(([1, 1, 1, 1], 53))
}

fn default_hijack_ttl() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectConfig {
    /// Read deadline applied to the other direction once one side hits EOF.
    #[serde(default = "default_linger")]
    pub tcp_linger_secs: u64,

    #[serde(default = "default_udp_idle")]
    pub udp_idle_timeout_secs: u64,

    /// Idle timeout for sessions carrying DNS.
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_secs: u64,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            tcp_linger_secs: default_linger(),
            udp_idle_timeout_secs: default_udp_idle(),
            dns_timeout_secs: default_dns_timeout(),
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

fn default_linger() -> u64 {
    10
}

fn default_udp_idle() -> u64 {
    180
}

fn default_dns_timeout() -> u64 {
    17
}

fn default_dial_timeout() -> u64 {
    10
}

impl RedirectConfig {
    pub fn tcp_linger(&self) -> Duration {
        Duration::from_secs(self.tcp_linger_secs)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Generate a default configuration.
    pub fn default_config() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.protocol == UpstreamProtocol::Socks5 && self.upstream.address.is_none() {
            return Err(ConfigError::Invalid(
                "upstream.address is required for socks5".to_string(),
            ));
        }
        if let Some(auth) = &self.upstream.auth {
            if auth.username.len() > 255 || auth.password.len() > 255 {
                return Err(ConfigError::Invalid(
                    "upstream credentials longer than 255 bytes".to_string(),
                ));
            }
        }
        if self.redirect.udp_idle_timeout_secs == 0 || self.redirect.dns_timeout_secs == 0 {
            return Err(ConfigError::Invalid("UDP timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}
