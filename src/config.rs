//! Top-level YAML configuration.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// How the proxy obtains targets and where matched traffic goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Redirected connections; targets recovered from the DNS cache.
    Transparent,
    /// Local SOCKS5 listener tunneling matched targets upstream.
    SocksLocal,
    /// Tunnel endpoint; dials matched targets directly.
    SocksServer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mode: Mode,

    /// Proxy listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Tunnel upstream, required unless running as the tunnel endpoint.
    pub upstream: Option<SocketAddr>,

    /// Tunnel key (base64 over the shuffled alphabet).
    pub key: Option<String>,

    /// Idle timeout for proxied connections, zero to disable.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Path of the access list YAML file, watched for changes.
    pub access_list: PathBuf,

    #[serde(default)]
    pub dns: DnsConfig,

    /// Per-port protocol filters; empty means http on 80 and 8081 plus
    /// tls on 443.
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Disables the forwarder entirely when false.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_dns_listen")]
    pub listen: SocketAddr,

    /// Upstream for unmatched names.
    #[serde(default = "default_dns_server")]
    pub default_server: SocketAddr,

    /// Upstream for names on the access list.
    #[serde(default = "specified_dns_server")]
    pub specified_server: SocketAddr,

    /// Answer matched queries from non-loopback clients with the
    /// sentinel address instead of forwarding them.
    #[serde(default)]
    pub public_service: bool,

    #[serde(default)]
    pub sentinel: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub port: u16,
    /// Filter name, `http` or `tls`.
    pub name: String,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1200))
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_dns_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 53))
}

fn default_dns_server() -> SocketAddr {
    SocketAddr::from(([114, 114, 114, 114], 53))
}

fn specified_dns_server() -> SocketAddr {
    SocketAddr::from(([8, 8, 8, 8], 53))
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_dns_listen(),
            default_server: default_dns_server(),
            specified_server: specified_dns_server(),
            public_service: false,
            sentinel: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            Mode::Transparent | Mode::SocksLocal => {
                if self.upstream.is_none() {
                    return Err(ConfigError::InvalidField {
                        field: "upstream",
                        value: "required for this mode".into(),
                    });
                }
                if self.key.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::InvalidField {
                        field: "key",
                        value: "required for this mode".into(),
                    });
                }
            }
            Mode::SocksServer => {
                if self.key.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::InvalidField {
                        field: "key",
                        value: "required for this mode".into(),
                    });
                }
            }
        }

        for filter in &self.filters {
            if crate::sniff::FilterKind::by_name(&filter.name).is_none() {
                return Err(ConfigError::InvalidField {
                    field: "filters",
                    value: filter.name.clone(),
                });
            }
        }

        if self.dns.public_service && self.dns.sentinel.is_none() {
            return Err(ConfigError::InvalidField {
                field: "dns.sentinel",
                value: "required when public_service is set".into(),
            });
        }

        Ok(())
    }

    /// Registered filter table, falling back to the defaults when the
    /// config names none.
    pub fn build_filters(&self) -> Result<crate::sniff::Filters, crate::sniff::FilterExists> {
        use crate::sniff::{FilterKind, Filters};

        let mut filters = Filters::new();
        if self.filters.is_empty() {
            filters.add(FilterKind::Http, 80)?;
            filters.add(FilterKind::Http, 8081)?;
            filters.add(FilterKind::Tls, 443)?;
            return Ok(filters);
        }
        for entry in &self.filters {
            // Validated names; unknown ones were rejected at load time.
            if let Some(kind) = FilterKind::by_name(&entry.name) {
                filters.add(kind, entry.port)?;
            }
        }
        Ok(filters)
    }
}
