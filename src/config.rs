//! Runtime configuration for vtex-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Cache geometry, loader limits, retry policy and the simulator's knobs all
//! live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::key::AddressSpace;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("virtual_side_tiles must be a non-zero power of two, got {0}")]
    VirtualSideNotPowerOfTwo(u32),

    #[error("cache_side_tiles must be between 1 and {max}, got {got}")]
    CacheSideOutOfRange { got: u32, max: u32 },

    #[error("tile_size_px must be non-zero")]
    ZeroTileSize,

    #[error("max_concurrent_fetches must be non-zero")]
    ZeroConcurrency,
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "vtex-cache", about = "Virtual texture tile cache simulator")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Number of frames to simulate (overrides the config file).
    #[arg(long)]
    pub frames: Option<u64>,

    /// Serve /metrics and /v1/cache/stats on this address while running.
    #[arg(long)]
    pub metrics_listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache geometry and residency policy.
    pub cache: CacheConfig,

    /// Fetch scheduling.
    pub loader: LoaderConfig,

    /// Where tile contents come from.
    pub source: SourceConfig,

    /// Simulated camera and frame pacing.
    pub simulation: SimulationConfig,

    /// Stats endpoint.
    pub metrics: MetricsConfig,
}

/// Cache geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Mip-0 tile grid side of the virtual space (power of two).
    pub virtual_side_tiles: u32,

    /// Physical slot grid side; capacity is its square.
    pub cache_side_tiles: u32,

    /// Tile edge in texels.
    pub tile_size_px: u32,

    /// Frames a loading tile may go unrequested before its fetch is cancelled.
    pub grace_period_frames: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            virtual_side_tiles: 1024,
            cache_side_tiles: 32,
            tile_size_px: 128,
            grace_period_frames: 4,
        }
    }
}

impl CacheConfig {
    pub fn capacity(&self) -> usize {
        (self.cache_side_tiles * self.cache_side_tiles) as usize
    }

    pub fn address_space(&self) -> Result<AddressSpace, ConfigError> {
        AddressSpace::new(self.virtual_side_tiles)
            .ok_or(ConfigError::VirtualSideNotPowerOfTwo(self.virtual_side_tiles))
    }
}

/// What to do after a transient fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Give up at once and rely on coarser ancestors.
    Drop,

    /// Retry while still needed, waiting `backoff_frames * 2^(n-1)` frames
    /// after the n-th failure, up to `max_attempts` fetches in total.
    Backoff { max_attempts: u32, backoff_frames: u64 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Backoff {
            max_attempts: 3,
            backoff_frames: 2,
        }
    }
}

impl RetryPolicy {
    /// Frames to wait after `failures` consecutive failures, or `None` to give up.
    pub fn delay_after(&self, failures: u32) -> Option<u64> {
        match *self {
            RetryPolicy::Drop => None,
            RetryPolicy::Backoff {
                max_attempts,
                backoff_frames,
            } => {
                if failures >= max_attempts {
                    return None;
                }
                let exp = failures.saturating_sub(1).min(16);
                Some(backoff_frames.saturating_mul(1u64 << exp))
            }
        }
    }
}

/// Fetch scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Fetches dispatched to the source at once.
    pub max_concurrent_fetches: usize,

    pub retry: RetryPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 16,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Synthetic,
    Disk,
}

/// Tile source selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,

    /// Root of the tile tree for the disk source.
    pub root: PathBuf,

    /// Disk tiles are zstd-packed.
    pub compressed: bool,

    /// Artificial per-fetch latency for the synthetic source.
    pub latency_ms: u64,

    /// Fraction of synthetic tiles whose first fetch fails.
    pub failure_rate: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Synthetic,
            root: PathBuf::from("/tmp/vtex-tiles"),
            compressed: false,
            latency_ms: 8,
            failure_rate: 0.0,
        }
    }
}

/// Simulated camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub frames: u64,

    /// Frame interval in milliseconds.
    pub frame_ms: u64,

    /// Visible window side, in tiles at `mip`.
    pub view_tiles: u32,

    /// Tiles the window moves per frame along x.
    pub pan_speed: u32,

    /// Mip level the camera samples.
    pub mip: u8,

    /// Coarser ancestors of the view also requested each frame.
    pub fallback_levels: u8,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            frames: 240,
            frame_ms: 16,
            view_tiles: 6,
            pan_speed: 1,
            mip: 0,
            fallback_levels: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the stats server; disabled when unset.
    pub listen: Option<String>,
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject geometry the cache cannot represent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.address_space()?;
        let max = u32::from(u16::MAX);
        if self.cache.cache_side_tiles == 0 || self.cache.cache_side_tiles > max {
            return Err(ConfigError::CacheSideOutOfRange {
                got: self.cache.cache_side_tiles,
                max,
            });
        }
        if self.cache.tile_size_px == 0 {
            return Err(ConfigError::ZeroTileSize);
        }
        if self.loader.max_concurrent_fetches == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }

    /// Bytes of physical memory the slot pool occupies (RGBA8).
    pub fn pool_bytes(&self) -> usize {
        let tile = (self.cache.tile_size_px * self.cache.tile_size_px) as usize * 4;
        tile * self.cache.capacity()
    }
}
