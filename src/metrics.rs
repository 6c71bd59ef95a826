//! Prometheus metrics for the cache.
//!
//! Counters advance by each frame's [`FrameReport`]; gauges are set from the
//! cache's state after the step. Rendered in the text exposition format for
//! the `/metrics` route.

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};

use crate::cache::manager::{CacheManager, FrameReport};
use crate::store::PhysicalStore;

pub struct CacheMetrics {
    registry: Registry,

    frames: IntCounter,
    hits: IntCounter,
    misses: IntCounter,
    fetches: IntCounter,
    retries: IntCounter,
    uploads: IntCounter,
    evictions: IntCounter,
    capacity_exhausted: IntCounter,
    cancellations: IntCounter,
    stale_completions: IntCounter,
    fetch_failures: IntCounter,
    given_up: IntCounter,
    invalid_keys: IntCounter,

    capacity: IntGauge,
    resident: IntGauge,
    loading: IntGauge,
    in_flight: IntGauge,
    pending: IntGauge,
    miss_rate: Gauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("vtex".to_string()), None)?;
        let r = &registry;

        let miss_rate = Gauge::new("miss_rate", "Fraction of needed tiles not resident last frame")?;
        registry.register(Box::new(miss_rate.clone()))?;

        Ok(Self {
            frames: counter(r, "frames_total", "Frame steps run")?,
            hits: counter(r, "hits_total", "Needed tiles found resident")?,
            misses: counter(r, "misses_total", "Needed tiles not resident")?,
            fetches: counter(r, "fetches_total", "Tile fetches started")?,
            retries: counter(r, "retries_total", "Fetches started after a failure")?,
            uploads: counter(r, "uploads_total", "Tiles uploaded into slots")?,
            evictions: counter(r, "evictions_total", "Resident tiles evicted")?,
            capacity_exhausted: counter(
                r,
                "capacity_exhausted_total",
                "Arrived tiles left unplaced because every slot was protected",
            )?,
            cancellations: counter(r, "cancellations_total", "Loads cancelled after the grace period")?,
            stale_completions: counter(r, "stale_completions_total", "Fetch results discarded as stale")?,
            fetch_failures: counter(r, "fetch_failures_total", "Failed tile fetches")?,
            given_up: counter(r, "given_up_total", "Tiles that exhausted their retries")?,
            invalid_keys: counter(r, "invalid_keys_total", "Needed keys outside the virtual space")?,
            capacity: gauge(r, "slot_capacity", "Physical slots in the pool")?,
            resident: gauge(r, "resident_tiles", "Tiles resident in slots")?,
            loading: gauge(r, "loading_tiles", "Tiles waiting for data")?,
            in_flight: gauge(r, "fetches_in_flight", "Fetches dispatched to the source")?,
            pending: gauge(r, "fetches_pending", "Fetches queued behind the concurrency limit")?,
            miss_rate,
            registry,
        })
    }

    /// Record one frame step.
    pub fn observe<S: PhysicalStore>(&self, report: &FrameReport, cache: &CacheManager<S>) {
        self.frames.inc();
        self.hits.inc_by(report.hits as u64);
        self.misses.inc_by(report.misses as u64);
        self.fetches.inc_by(report.new_requests as u64);
        self.retries.inc_by(report.retries as u64);
        self.uploads.inc_by(report.committed.len() as u64);
        self.evictions.inc_by(report.evicted.len() as u64);
        self.capacity_exhausted.inc_by(report.capacity_exhausted as u64);
        self.cancellations.inc_by(report.cancelled.len() as u64);
        self.stale_completions.inc_by(report.stale_completions as u64);
        self.fetch_failures.inc_by(report.failed.len() as u64);
        self.given_up.inc_by(report.given_up as u64);
        self.invalid_keys.inc_by(report.invalid_keys as u64);

        self.capacity.set(cache.capacity() as i64);
        self.resident.set(cache.resident_count() as i64);
        self.loading.set(cache.loading_count() as i64);
        self.in_flight.set(cache.scheduler().in_flight_count() as i64);
        self.pending.set(cache.scheduler().pending_count() as i64);
        self.miss_rate.set(report.miss_rate());
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_prefixed_metrics() {
        let metrics = CacheMetrics::new().unwrap();
        metrics.frames.inc();
        metrics.miss_rate.set(0.25);
        let text = metrics.render().unwrap();
        assert!(text.contains("vtex_frames_total 1"));
        assert!(text.contains("vtex_miss_rate 0.25"));
        assert!(text.contains("# HELP vtex_resident_tiles"));
    }

    #[tokio::test]
    async fn test_observe_counts_given_up_tiles() {
        use std::sync::Arc;

        use crate::cache::key::TileKey;
        use crate::config::Config;
        use crate::loader::scripted::ScriptedSource;
        use crate::loader::source::FetchError;
        use crate::store::memory::MemoryStore;

        let mut config = Config::default();
        config.cache.virtual_side_tiles = 16;
        config.cache.cache_side_tiles = 2;
        config.cache.tile_size_px = 1;
        let source = Arc::new(ScriptedSource::new());
        let store = MemoryStore::new(2, 1);
        let mut cache = CacheManager::new(Arc::new(config), source.clone(), store).unwrap();

        let key = TileKey::new(1, 1, 0);
        cache.request_tiles(&[key]);
        source.fail(key, FetchError::NotFound(key));
        cache.wait_for_completions(1).await;
        let report = cache.request_tiles(&[key]);
        assert_eq!(report.given_up, 1);

        let metrics = CacheMetrics::new().unwrap();
        metrics.observe(&report, &cache);
        let text = metrics.render().unwrap();
        assert!(text.contains("vtex_fetch_failures_total 1"));
        assert!(text.contains("vtex_given_up_total 1"));
    }
}
