//! Tiles stored as files on local disk.
//!
//! Layout: `{root}/{mip}/{y}/{x}.tile`, raw RGBA8 rows of a square tile, or
//! `{x}.tile.zst` when the tree is zstd-compressed. Uses tokio's async file
//! I/O so slow disks only stall the loader task, never the frame loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::cache::key::TileKey;
use crate::loader::source::{FetchError, TileData, TileSource};

#[derive(Error, Debug)]
pub enum DiskSourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tile {key} has {actual} bytes, expected {expected}")]
    WrongSize {
        key: TileKey,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Default)]
pub struct DiskSourceStats {
    pub total_reads: AtomicU64,
    pub total_bytes_read: AtomicU64,
    pub total_misses: AtomicU64,
}

/// Reads tiles from a directory tree.
pub struct DiskTileSource {
    root: PathBuf,
    tile_size: u32,
    compressed: bool,
    zstd_level: i32,
    stats: DiskSourceStats,
}

impl DiskTileSource {
    pub fn new(root: impl Into<PathBuf>, tile_size: u32, compressed: bool) -> Self {
        Self {
            root: root.into(),
            tile_size,
            compressed,
            zstd_level: 3,
            stats: DiskSourceStats::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> &DiskSourceStats {
        &self.stats
    }

    /// File path for `key`.
    pub fn tile_path(&self, key: &TileKey) -> PathBuf {
        let ext = if self.compressed { "tile.zst" } else { "tile" };
        self.root
            .join(key.mip.to_string())
            .join(key.y.to_string())
            .join(format!("{}.{ext}", key.x))
    }

    fn expected_len(&self) -> usize {
        (self.tile_size * self.tile_size * 4) as usize
    }

    /// Write a tile into the tree, creating directories as needed.
    pub async fn write_tile(&self, key: &TileKey, tile: &TileData) -> Result<PathBuf, DiskSourceError> {
        if tile.bytes.len() != self.expected_len() {
            return Err(DiskSourceError::WrongSize {
                key: *key,
                expected: self.expected_len(),
                actual: tile.bytes.len(),
            });
        }

        let path = self.tile_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if self.compressed {
            let packed = zstd::encode_all(&tile.bytes[..], self.zstd_level)?;
            fs::write(&path, packed).await?;
        } else {
            fs::write(&path, &tile.bytes).await?;
        }

        debug!(key = %key, path = %path.display(), "Wrote tile to disk");
        Ok(path)
    }

    async fn read_tile(&self, key: &TileKey) -> Result<Option<Vec<u8>>, DiskSourceError> {
        let path = self.tile_path(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_read
            .fetch_add(raw.len() as u64, Ordering::Relaxed);

        let data = if self.compressed {
            zstd::decode_all(&raw[..])?
        } else {
            raw
        };

        if data.len() != self.expected_len() {
            return Err(DiskSourceError::WrongSize {
                key: *key,
                expected: self.expected_len(),
                actual: data.len(),
            });
        }

        Ok(Some(data))
    }
}

#[async_trait]
impl TileSource for DiskTileSource {
    async fn fetch(&self, key: TileKey) -> Result<TileData, FetchError> {
        match self.read_tile(&key).await {
            Ok(Some(data)) => Ok(TileData::new(data, self.tile_size, self.tile_size)),
            Ok(None) => {
                self.stats.total_misses.fetch_add(1, Ordering::Relaxed);
                Err(FetchError::NotFound(key))
            }
            Err(DiskSourceError::WrongSize { expected, actual, .. }) => Err(FetchError::Corrupt {
                key,
                reason: format!("{actual} bytes, expected {expected}"),
            }),
            Err(DiskSourceError::Io(e)) => Err(FetchError::Transient(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_fetch_tile() {
        let tmp = TempDir::new().unwrap();
        let source = DiskTileSource::new(tmp.path(), 4, false);
        let key = TileKey::new(3, 1, 2);
        let tile = TileData::solid(4, [10, 20, 30, 255]);

        let path = source.write_tile(&key, &tile).await.unwrap();
        assert!(path.ends_with("2/1/3.tile"));

        let fetched = source.fetch(key).await.unwrap();
        assert_eq!(fetched, tile);
        assert_eq!(source.stats().total_reads.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_compressed_round_trip() {
        let tmp = TempDir::new().unwrap();
        let source = DiskTileSource::new(tmp.path(), 8, true);
        let key = TileKey::new(0, 0, 0);
        let tile = TileData::solid(8, [1, 1, 1, 1]);

        source.write_tile(&key, &tile).await.unwrap();
        let on_disk = std::fs::metadata(source.tile_path(&key)).unwrap().len();
        assert!(on_disk < 8 * 8 * 4);
        assert_eq!(source.fetch(key).await.unwrap(), tile);
    }

    #[tokio::test]
    async fn test_missing_tile_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let source = DiskTileSource::new(tmp.path(), 4, false);
        let key = TileKey::new(9, 9, 0);
        assert_eq!(source.fetch(key).await, Err(FetchError::NotFound(key)));
    }

    #[tokio::test]
    async fn test_truncated_tile_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let source = DiskTileSource::new(tmp.path(), 4, false);
        let key = TileKey::new(0, 0, 0);
        let path = source.tile_path(&key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, [0u8; 7]).unwrap();
        assert!(matches!(source.fetch(key).await, Err(FetchError::Corrupt { .. })));
    }
}
