use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus registry for the pipeline's own internal counters.
///
/// Scoped to what the pipeline itself observes — cache hit/miss, session
/// table occupancy, istream error counts, loader dispatch outcomes — not a
/// general request/route/plugin metrics surface (the request handler and
/// its routing layer are external collaborators, spec §1).
pub struct MetricsCollector {
    registry: Registry,

    pub cache_hits: IntCounterVec,
    pub cache_misses: IntCounterVec,
    pub sessions_active: IntGauge,
    pub istream_errors: IntCounterVec,
    pub loader_dispatches: IntCounterVec,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let cache_hits = IntCounterVec::new(
            Opts::new("sb_cache_hits_total", "Cache lookups that found a live entry").namespace("sb"),
            &["cache"],
        )?;
        let cache_misses = IntCounterVec::new(
            Opts::new("sb_cache_misses_total", "Cache lookups that found nothing or an expired entry").namespace("sb"),
            &["cache"],
        )?;
        let sessions_active = IntGauge::new("sb_sessions_active", "Sessions currently held in the session table")?;
        let istream_errors = IntCounterVec::new(
            Opts::new("sb_istream_errors_total", "Errors surfaced by istream filters").namespace("sb"),
            &["filter"],
        )?;
        let loader_dispatches = IntCounterVec::new(
            Opts::new("sb_loader_dispatches_total", "Resource loader dispatches by backend kind and outcome").namespace("sb"),
            &["backend", "outcome"],
        )?;

        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(istream_errors.clone()))?;
        registry.register(Box::new(loader_dispatches.clone()))?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            sessions_active,
            istream_errors,
            loader_dispatches,
        })
    }

    /// Prometheus text exposition, served by the request handler at its
    /// configured metrics path (spec's `PrometheusConfig::path`).
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("metric descriptors are static and well-formed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_cache_hits_and_misses_separately() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.cache_hits.with_label_values(&["responses"]).inc();
        metrics.cache_misses.with_label_values(&["responses"]).inc_by(2);

        let text = metrics.gather_text();
        assert!(text.contains("sb_cache_hits_total"));
        assert!(text.contains("sb_cache_misses_total"));
    }

    #[test]
    fn gauge_reflects_latest_set_value() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.sessions_active.set(42);
        assert_eq!(metrics.sessions_active.get(), 42);
    }

    #[test]
    fn default_constructs_without_panicking() {
        let _metrics = MetricsCollector::default();
    }
}
