use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheStatus {
    Hit,
    Miss,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub status: CacheStatus,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ArtifactKind {
    Blob,
    Manifest,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExpiryLabels {
    pub kind: ArtifactKind,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- serving --
    pub blob_requests: Family<CacheLabels, Counter>,
    pub manifest_requests: Family<CacheLabels, Counter>,

    // -- upstream --
    pub upstream_fetches: Counter,
    pub upstream_fetch_failures: Counter,

    // -- cache maintenance --
    pub blob_mounts: Counter,
    pub expirations: Family<ExpiryLabels, Counter>,
    pub scheduler_entries: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let blob_requests = Family::<CacheLabels, Counter>::default();
        registry.register(
            "ocicache_blob_requests_total",
            "Blob serve requests by cache status",
            blob_requests.clone(),
        );

        let manifest_requests = Family::<CacheLabels, Counter>::default();
        registry.register(
            "ocicache_manifest_requests_total",
            "Manifest requests by cache status",
            manifest_requests.clone(),
        );

        let upstream_fetches = Counter::default();
        registry.register(
            "ocicache_upstream_fetches_total",
            "Pull-through fetches issued to the upstream registry",
            upstream_fetches.clone(),
        );

        let upstream_fetch_failures = Counter::default();
        registry.register(
            "ocicache_upstream_fetch_failures_total",
            "Pull-through fetches that failed before commit",
            upstream_fetch_failures.clone(),
        );

        let blob_mounts = Counter::default();
        registry.register(
            "ocicache_blob_mounts_total",
            "Cross-repository auto-mounts served without a network fetch",
            blob_mounts.clone(),
        );

        let expirations = Family::<ExpiryLabels, Counter>::default();
        registry.register(
            "ocicache_expirations_total",
            "TTL expirations fired by artifact kind",
            expirations.clone(),
        );

        let scheduler_entries: Gauge = Gauge::default();
        registry.register(
            "ocicache_scheduler_entries",
            "Entries currently tracked by the TTL scheduler",
            scheduler_entries.clone(),
        );

        Self {
            blob_requests,
            manifest_requests,
            upstream_fetches,
            upstream_fetch_failures,
            blob_mounts,
            expirations,
            scheduler_entries,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in shared state.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
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
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
