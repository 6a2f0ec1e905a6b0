//! Configuration loading and validation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result, ValidationError};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dnsfsd/config.toml";

/// Main configuration for the dnsfs server.
///
/// Every section is optional; missing sections fall back to their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub dns: DnsSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub rules: RulesSettings,

    #[serde(default)]
    pub log: LogSettings,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Listening socket settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// UDP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address to bind.
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

/// Upstream forwarding settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsSettings {
    /// Upstream resolvers (`host:port`), tried in this order.
    #[serde(default = "default_forwards")]
    pub forwards: Vec<String>,

    /// Hard timeout for a single upstream attempt, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            forwards: default_forwards(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Decision and answer cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// Default TTL for both caches, in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,

    /// Where the answer cache snapshot is read from and written to.
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    /// Interval between active sweeps of expired entries.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl(),
            path: default_cache_path(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Rule file settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesSettings {
    /// Directory holding the rule files.
    #[serde(default = "default_rules_directory")]
    pub directory: PathBuf,
}

impl Default for RulesSettings {
    fn default() -> Self {
        Self {
            directory: default_rules_directory(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSettings {
    /// File the log is appended to, in addition to stdout.
    #[serde(default = "default_log_path")]
    pub path: PathBuf,

    /// Log every query decision at info level.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            verbose: false,
        }
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

const fn default_port() -> u16 {
    53
}

const fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_forwards() -> Vec<String> {
    vec!["1.0.0.1:53".to_string(), "1.1.1.1:53".to_string()]
}

const fn default_timeout_ms() -> u64 {
    2000
}

const fn default_cache_ttl() -> u64 {
    86400
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("/etc/dnsfsd/dns.cache")
}

const fn default_sweep_interval() -> u64 {
    300
}

fn default_rules_directory() -> PathBuf {
    PathBuf::from("/etc/dnsfsd/rules")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/dnsfsd/log.txt")
}

const fn default_metrics_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9090)
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Address the UDP listener binds to.
    pub const fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind, self.server.port)
    }

    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_seconds)
    }

    pub const fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.dns.timeout_ms)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_seconds)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<()> {
        if self.dns.forwards.is_empty() {
            return Err(ConfigError::Validation(ValidationError::NoUpstreams).into());
        }

        for address in &self.dns.forwards {
            check_upstream(address).map_err(ConfigError::Validation)?;
        }

        if self.cache.ttl_seconds == 0 {
            return Err(ConfigError::Validation(ValidationError::ZeroCacheTtl).into());
        }

        if self.cache.sweep_interval_seconds == 0 {
            return Err(ConfigError::Validation(ValidationError::ZeroSweepInterval).into());
        }

        if self.dns.timeout_ms == 0 {
            return Err(ConfigError::Validation(ValidationError::ZeroUpstreamTimeout).into());
        }

        Ok(())
    }
}

/// Syntax check for a `host:port` upstream. Names are resolved at start.
fn check_upstream(address: &str) -> std::result::Result<(), ValidationError> {
    let invalid = |reason| ValidationError::InvalidUpstream {
        address: address.to_string(),
        reason,
    };

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;

    match port.parse::<u16>() {
        Ok(port) if port > 0 => {}
        _ => return Err(invalid("invalid port")),
    }

    let host = match host.strip_prefix('[') {
        Some(rest) => rest
            .strip_suffix(']')
            .filter(|inner| inner.parse::<Ipv6Addr>().is_ok())
            .ok_or_else(|| invalid("invalid bracketed IPv6 address"))?,
        None if host.contains(':') => return Err(invalid("IPv6 addresses must be bracketed")),
        None => host,
    };

    let valid_name = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':'));
    if host.is_empty() || !valid_name {
        return Err(invalid("invalid host"));
    }

    Ok(())
}
