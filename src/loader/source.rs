//! The tile source seam and the procedural source used by the simulator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache::key::TileKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Tile {0} does not exist in the source")]
    NotFound(TileKey),

    #[error("Transient fetch failure: {0}")]
    Transient(String),

    #[error("Corrupt tile {key}: {reason}")]
    Corrupt { key: TileKey, reason: String },
}

impl FetchError {
    /// Whether retrying the same key can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::NotFound(_))
    }
}

/// Raw texels for one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileData {
    /// Tightly packed RGBA8 rows.
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
}

impl TileData {
    pub fn new(bytes: impl Into<Bytes>, width: u32, height: u32) -> Self {
        Self {
            bytes: bytes.into(),
            width,
            height,
        }
    }

    /// A tile filled with a single RGBA colour.
    pub fn solid(size: u32, rgba: [u8; 4]) -> Self {
        let texels = (size * size) as usize;
        let mut data = Vec::with_capacity(texels * 4);
        for _ in 0..texels {
            data.extend_from_slice(&rgba);
        }
        Self::new(data, size, size)
    }
}

/// Backing store for tile contents (disk, network, procedural).
///
/// `fetch` runs on a loader task and may take arbitrarily long. `cancel` is a
/// hint that the result is no longer wanted; implementations may ignore it,
/// the scheduler discards the eventual result either way.
#[async_trait]
pub trait TileSource: Send + Sync + 'static {
    async fn fetch(&self, key: TileKey) -> Result<TileData, FetchError>;

    fn cancel(&self, _key: TileKey) {}
}

/// Procedural checkerboard tiles, tinted per mip level.
///
/// Keys selected by `failure_rate` fail their first fetch with a transient
/// error and succeed on retry, which exercises the backoff path.
pub struct SyntheticSource {
    tile_size: u32,
    latency: Duration,
    failure_rate: f64,
    attempts: Mutex<HashMap<TileKey, u32>>,
    cancels: AtomicU64,
}

impl SyntheticSource {
    pub fn new(tile_size: u32) -> Self {
        Self {
            tile_size,
            latency: Duration::ZERO,
            failure_rate: 0.0,
            attempts: Mutex::new(HashMap::new()),
            cancels: AtomicU64::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Number of cancel hints received.
    pub fn cancel_count(&self) -> u64 {
        self.cancels.load(Ordering::Relaxed)
    }

    fn is_flaky(&self, key: &TileKey) -> bool {
        let hash = key
            .x
            .wrapping_mul(73_856_093)
            ^ key.y.wrapping_mul(19_349_663)
            ^ u32::from(key.mip).wrapping_mul(83_492_791);
        f64::from(hash % 1000) < self.failure_rate * 1000.0
    }

    fn render(&self, key: &TileKey) -> TileData {
        let size = self.tile_size;
        let tint = [
            64u8.saturating_add(key.mip.saturating_mul(24)),
            (key.x % 256) as u8,
            (key.y % 256) as u8,
        ];
        let cell = (size / 8).max(1);
        let mut data = Vec::with_capacity((size * size * 4) as usize);
        for py in 0..size {
            for px in 0..size {
                let dark = ((px / cell) + (py / cell)) % 2 == 0;
                let shade = if dark { 2 } else { 1 };
                data.extend_from_slice(&[tint[0] / shade, tint[1] / shade, tint[2] / shade, 255]);
            }
        }
        TileData::new(data, size, size)
    }
}

#[async_trait]
impl TileSource for SyntheticSource {
    async fn fetch(&self, key: TileKey) -> Result<TileData, FetchError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let attempt = {
            let mut attempts = self
                .attempts
                .lock()
                .map_err(|_| FetchError::Transient("attempt table poisoned".to_string()))?;
            let n = attempts.entry(key).or_insert(0);
            *n += 1;
            *n
        };

        if attempt == 1 && self.is_flaky(&key) {
            return Err(FetchError::Transient(format!("simulated failure for {key}")));
        }

        Ok(self.render(&key))
    }

    fn cancel(&self, _key: TileKey) {
        self.cancels.fetch_add(1, Ordering::Relaxed);
    }
}
