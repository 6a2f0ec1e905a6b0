//! dnsfs - a local DNS filtering sinkhole.
//!
//! dnsfs answers queries for domains matched by its rule set with an empty
//! reply, and forwards everything else to a prioritized list of upstream
//! resolvers, caching their answers across restarts.
//!
//! # Architecture
//!
//! - [`rules`]: rule parsing, evaluation, loading, download and list conversion
//! - [`cache`]: the expiring cache and the persisted answer cache
//! - [`dns`]: per-query resolution, upstream resolvers and the error queue
//! - [`server`]: socket, background tasks and shutdown
//! - [`config`]: configuration loading and validation
//! - [`error`]: error types
//!
//! # Testing
//!
//! Upstreams and reply delivery sit behind traits so the resolution path can
//! be exercised without network access:
//!
//! ```rust
//! use dnsfs::rules::{Rule, RuleSet};
//!
//! let set = RuleSet::new(Rule::parse_line("e;;ads.example.com").unwrap());
//! assert!(set.test("ADS.example.com"));
//! ```

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod rules;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
