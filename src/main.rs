//! vtex-cache simulator.
//!
//! Drives the cache with a panning camera at a fixed frame rate, fetching
//! tiles from a synthetic or on-disk source, and optionally serves live
//! statistics over HTTP.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use vtex_cache::cache::manager::CacheManager;
use vtex_cache::config::{Cli, Config, SourceKind};
use vtex_cache::feedback::{FeedbackProvider, ViewportFeedback};
use vtex_cache::loader::disk::DiskTileSource;
use vtex_cache::loader::source::{SyntheticSource, TileSource};
use vtex_cache::metrics::CacheMetrics;
use vtex_cache::server::stats_api::{build_router, AppState};
use vtex_cache::store::memory::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "vtex_cache=debug,tower_http=debug"
    } else {
        "vtex_cache=info,tower_http=info"
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("vtex-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(frames) = cli.frames {
        config.simulation.frames = frames;
    }
    if cli.metrics_listen.is_some() {
        config.metrics.listen = cli.metrics_listen.clone();
    }
    config.validate()?;
    let config = Arc::new(config);

    info!(
        virtual_side = config.cache.virtual_side_tiles,
        cache_side = config.cache.cache_side_tiles,
        capacity = config.cache.capacity(),
        tile_size = config.cache.tile_size_px,
        pool_bytes = config.pool_bytes(),
        "Configuration loaded"
    );

    // Tile source.
    let source: Arc<dyn TileSource> = match config.source.kind {
        SourceKind::Synthetic => Arc::new(
            SyntheticSource::new(config.cache.tile_size_px)
                .with_latency(Duration::from_millis(config.source.latency_ms))
                .with_failure_rate(config.source.failure_rate),
        ),
        SourceKind::Disk => {
            info!(root = %config.source.root.display(), compressed = config.source.compressed, "Reading tiles from disk");
            Arc::new(DiskTileSource::new(
                config.source.root.clone(),
                config.cache.tile_size_px,
                config.source.compressed,
            ))
        }
    };

    let store = MemoryStore::new(config.cache.cache_side_tiles as u16, config.cache.tile_size_px);
    let mut cache = CacheManager::new(config.clone(), source, store)?;

    let space = config.cache.address_space()?;
    let sim = &config.simulation;
    let mut feedback = ViewportFeedback::new(space, sim.mip, sim.view_tiles, sim.pan_speed)
        .with_fallback_levels(sim.fallback_levels);

    // Stats server.
    let state = Arc::new(AppState::new(CacheMetrics::new()?));
    if let Some(addr) = config.metrics.listen.clone() {
        let listener = TcpListener::bind(&addr).await?;
        info!("Serving stats on {addr}");
        let app = build_router(state.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Stats server stopped");
            }
        });
    }

    // Frame loop.
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(sim.frame_ms.max(1)));
    for frame in 0..sim.frames {
        ticker.tick().await;

        let needed = feedback.needed_tiles(frame);
        let report = cache.request_tiles(&needed);
        state.publish(&report, &cache).await;

        if report.frame % 60 == 0 {
            info!(
                frame = report.frame,
                needed = report.needed,
                resident = cache.resident_count(),
                loading = cache.loading_count(),
                miss_rate = report.miss_rate(),
                "Frame"
            );
        }
    }

    let problems = cache.check_invariants();
    for problem in &problems {
        error!(problem = %problem, "Cache invariant violated");
    }

    let stats = cache.stats();
    let hit_rate = if stats.tiles_needed == 0 {
        0.0
    } else {
        stats.hits as f64 / stats.tiles_needed as f64
    };
    info!(
        frames = stats.frames,
        elapsed_ms = started.elapsed().as_millis() as u64,
        hit_rate,
        fetches = stats.fetches_issued,
        uploads = stats.uploads,
        evictions = stats.evictions,
        cancellations = stats.cancellations,
        capacity_exhausted = stats.capacity_exhausted,
        given_up = stats.given_up,
        "Simulation complete"
    );

    if !problems.is_empty() {
        anyhow::bail!("{} cache invariant violations", problems.len());
    }
    Ok(())
}
