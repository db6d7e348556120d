use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub handle: String,
    pub outcome: Outcome,
}

/// Terminal state of a request that reached a known repository.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    ServedFromCache,
    Forwarded,
    Deleted,
    NotFound,
    MethodNotAllowed,
    BadRequest,
    BadGateway,
    ClientCanceled,
    Internal,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MirrorLabels {
    pub mirror: String,
    pub result: MirrorResult,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum MirrorResult {
    Ok,
    BadStatus,
    Error,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- pipeline --
    pub requests_total: Family<OutcomeLabels, Counter>,
    pub passthrough_total: Counter,

    // -- mirrors --
    pub mirror_requests_total: Family<MirrorLabels, Counter>,
    pub upstream_duration_seconds: Histogram,

    // -- cache fill --
    pub cache_fill_bytes: Counter,
    pub cache_write_failures: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        // Counters are exposed with a `_total` suffix added by the encoder.
        let requests_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "pkgproxy_requests",
            "Repository requests by handle and terminal outcome",
            requests_total.clone(),
        );

        let passthrough_total = Counter::default();
        registry.register(
            "pkgproxy_passthrough",
            "Requests not addressed to a configured repository",
            passthrough_total.clone(),
        );

        let mirror_requests_total = Family::<MirrorLabels, Counter>::default();
        registry.register(
            "pkgproxy_mirror_requests",
            "Mirror attempts by mirror host and result",
            mirror_requests_total.clone(),
        );

        let upstream_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 14));
        registry.register(
            "pkgproxy_upstream_duration_seconds",
            "Time to response headers per mirror attempt",
            upstream_duration_seconds.clone(),
        );

        let cache_fill_bytes = Counter::default();
        registry.register(
            "pkgproxy_cache_fill_bytes",
            "Bytes written to the package cache",
            cache_fill_bytes.clone(),
        );

        let cache_write_failures = Counter::default();
        registry.register(
            "pkgproxy_cache_write_failures",
            "Cache fills that failed to reach disk",
            cache_write_failures.clone(),
        );

        Self {
            requests_total,
            passthrough_total,
            mirror_requests_total,
            upstream_duration_seconds,
            cache_fill_bytes,
            cache_write_failures,
        }
    }

    pub fn record(&self, handle: &str, outcome: Outcome) {
        self.requests_total
            .get_or_create(&OutcomeLabels {
                handle: handle.to_string(),
                outcome,
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}
