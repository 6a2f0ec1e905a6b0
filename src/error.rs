//! Error types for the dnsfs resolver.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::cache::PersistError;
use crate::rules::RuleError;

/// Main error type for dnsfs operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("rule error: {0}")]
    Rules(#[from] RuleError),

    #[error("answer cache error: {0}")]
    Persist(#[from] PersistError),

    #[error("DNS protocol error: {0}")]
    Protocol(#[from] hickory_proto::error::ProtoError),

    #[error("resolver error: {0}")]
    Resolver(String),

    #[error("cannot resolve upstream {address:?}: {source}")]
    UpstreamLookup {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("upstream {0:?} resolved to no address")]
    NoUpstreamAddress(String),

    #[error("listening socket is closed")]
    ListenerClosed,

    #[error("upstream {0} did not answer in time")]
    Timeout(SocketAddr),

    #[error("upstream {upstream} answered with id {got}, expected {expected}")]
    IdMismatch {
        upstream: SocketAddr,
        expected: u16,
        got: u16,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("dns.forwards must list at least one upstream")]
    NoUpstreams,

    #[error("invalid upstream {address:?}: {reason}")]
    InvalidUpstream {
        address: String,
        reason: &'static str,
    },

    #[error("cache.ttl_seconds must be greater than 0")]
    ZeroCacheTtl,

    #[error("cache.sweep_interval_seconds must be greater than 0")]
    ZeroSweepInterval,

    #[error("dns.timeout_ms must be greater than 0")]
    ZeroUpstreamTimeout,
}

/// Failures published on the error queue by the resolution handler.
///
/// None of these stop the server; they are handed to whoever consumes the
/// queue, normally the logging task.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no upstream answered {query} (tried {upstreams:?}): {last_error}")]
    UpstreamsExhausted {
        query: String,
        upstreams: Vec<SocketAddr>,
        last_error: String,
    },

    #[error("failed to write reply for {query} to {peer}: {source}")]
    ReplyWrite {
        query: String,
        peer: SocketAddr,
        #[source]
        source: Error,
    },
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
