//! CPU-side atlas store.
//!
//! Holds the physical cache as one RGBA8 image of
//! `(side * tile_size)²` texels, with each slot a `tile_size²` square.

use tracing::debug;

use crate::cache::slot::PhysicalSlot;
use crate::loader::source::TileData;
use crate::store::{PhysicalStore, StoreError};

const BYTES_PER_TEXEL: usize = 4;

#[derive(Debug)]
pub struct MemoryStore {
    side: u16,
    tile_size: u32,
    atlas: Vec<u8>,
    uploads: u64,
}

impl MemoryStore {
    pub fn new(side: u16, tile_size: u32) -> Self {
        let extent = usize::from(side) * tile_size as usize;
        Self {
            side,
            tile_size,
            atlas: vec![0; extent * extent * BYTES_PER_TEXEL],
            uploads: 0,
        }
    }

    /// Width (and height) of the atlas in texels.
    pub fn extent(&self) -> usize {
        usize::from(self.side) * self.tile_size as usize
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads
    }

    /// The whole atlas, row-major RGBA8.
    pub fn atlas(&self) -> &[u8] {
        &self.atlas
    }

    /// Read one texel of a slot.
    pub fn texel(&self, slot: PhysicalSlot, px: u32, py: u32) -> Option<[u8; 4]> {
        if slot.x >= self.side || slot.y >= self.side || px >= self.tile_size || py >= self.tile_size {
            return None;
        }
        let offset = self.texel_offset(slot, px, py);
        let mut out = [0u8; 4];
        out.copy_from_slice(&self.atlas[offset..offset + BYTES_PER_TEXEL]);
        Some(out)
    }

    fn texel_offset(&self, slot: PhysicalSlot, px: u32, py: u32) -> usize {
        let ts = self.tile_size as usize;
        let x = usize::from(slot.x) * ts + px as usize;
        let y = usize::from(slot.y) * ts + py as usize;
        (y * self.extent() + x) * BYTES_PER_TEXEL
    }
}

impl PhysicalStore for MemoryStore {
    fn upload(&mut self, slot: PhysicalSlot, tile: &TileData) -> Result<(), StoreError> {
        if slot.x >= self.side || slot.y >= self.side {
            return Err(StoreError::SlotOutOfRange(slot));
        }
        if tile.width != self.tile_size || tile.height != self.tile_size {
            return Err(StoreError::DimensionMismatch {
                expected: self.tile_size,
                width: tile.width,
                height: tile.height,
            });
        }
        let row = self.tile_size as usize * BYTES_PER_TEXEL;
        let expected = row * self.tile_size as usize;
        if tile.bytes.len() < expected {
            return Err(StoreError::ShortBuffer {
                expected,
                actual: tile.bytes.len(),
            });
        }

        for py in 0..self.tile_size {
            let dst = self.texel_offset(slot, 0, py);
            let src = py as usize * row;
            self.atlas[dst..dst + row].copy_from_slice(&tile.bytes[src..src + row]);
        }

        self.uploads += 1;
        debug!(slot = %slot, bytes = expected, "Uploaded tile");
        Ok(())
    }
}
