//! Stats API.
//!
//! Read-only routes over state the frame loop publishes after each step:
//! - GET /health
//! - GET /metrics
//! - GET /v1/cache/stats

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::cache::manager::{CacheManager, CacheStats, FrameReport};
use crate::loader::scheduler::LoadStats;
use crate::metrics::CacheMetrics;
use crate::store::PhysicalStore;

/// Application state shared across handlers.
pub struct AppState {
    pub stats: RwLock<StatsView>,
    pub metrics: CacheMetrics,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(metrics: CacheMetrics) -> Self {
        Self {
            stats: RwLock::new(StatsView::default()),
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Publish the cache's state after a frame step.
    pub async fn publish<S: PhysicalStore>(&self, report: &FrameReport, cache: &CacheManager<S>) {
        self.metrics.observe(report, cache);
        *self.stats.write().await = StatsView::capture(cache);
    }
}

/// Build the axum router with all stats routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/cache/stats", get(cache_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Response Types ────────────────────────────────────────────────────────

/// Point-in-time view of the cache.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsView {
    pub frame: u64,
    pub capacity: usize,
    pub resident: usize,
    pub loading: usize,
    pub parked: usize,
    pub miss_rate_last_frame: f64,
    pub totals: CacheStats,
    pub loader: LoadStats,
    pub last_frame: FrameReport,
}

impl StatsView {
    pub fn capture<S: PhysicalStore>(cache: &CacheManager<S>) -> Self {
        Self {
            frame: cache.frame(),
            capacity: cache.capacity(),
            resident: cache.resident_count(),
            loading: cache.loading_count(),
            parked: cache.parked_count(),
            miss_rate_last_frame: cache.miss_rate_last_frame(),
            totals: cache.stats().clone(),
            loader: cache.load_stats().clone(),
            last_frame: cache.last_report().clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub frame: u64,
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let frame = state.stats.read().await.frame;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        frame,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, StatusCode> {
    match state.metrics.render() {
        Ok(body) => Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<StatsView> {
    Json(state.stats.read().await.clone())
}
