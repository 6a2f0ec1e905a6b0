//! Metrics initialization for Prometheus exporter.
//!
//! Counters are recorded through the `metrics` facade everywhere; without an
//! installed recorder they cost nothing.

use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

pub const QUERIES_TOTAL: &str = "dnsfs_queries_total";
pub const QUERIES_SUNK_TOTAL: &str = "dnsfs_queries_sunk_total";
pub const ANSWER_CACHE_HITS_TOTAL: &str = "dnsfs_answer_cache_hits_total";
pub const QUERIES_FORWARDED_TOTAL: &str = "dnsfs_queries_forwarded_total";
pub const UPSTREAM_FAILURES_TOTAL: &str = "dnsfs_upstream_failures_total";

/// Initialize the metrics system based on configuration.
///
/// When enabled, this starts an HTTP listener exposing `/metrics` for
/// Prometheus to scrape. Otherwise it is a no-op.
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|err| Error::Metrics(err.to_string()))?;

    describe();
    Ok(())
}

fn describe() {
    describe_counter!(QUERIES_TOTAL, "DNS queries received");
    describe_counter!(QUERIES_SUNK_TOTAL, "Queries answered with an empty reply");
    describe_counter!(
        ANSWER_CACHE_HITS_TOTAL,
        "Queries answered from the answer cache"
    );
    describe_counter!(QUERIES_FORWARDED_TOTAL, "Queries sent upstream");
    describe_counter!(UPSTREAM_FAILURES_TOTAL, "Failed upstream attempts");
}
