//! Physical tile storage (the upload sink).
//!
//! - [`memory`]: CPU-side atlas used by the simulator and tests

pub mod memory;

use thiserror::Error;

use crate::cache::slot::PhysicalSlot;
use crate::loader::source::TileData;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Tile is {width}x{height}, store expects {expected}x{expected}")]
    DimensionMismatch { expected: u32, width: u32, height: u32 },

    #[error("Tile has {actual} bytes, expected {expected}")]
    ShortBuffer { expected: usize, actual: usize },

    #[error("Slot {0} is outside the atlas")]
    SlotOutOfRange(PhysicalSlot),

    #[error("Device upload failed: {0}")]
    Device(String),
}

/// Writes tile texels into the slot's backing memory.
///
/// Called only from the cache's frame step. Implementations must fence the
/// write so it never races a render-thread read of the same slot, typically
/// by recording the copy into the next frame's command stream.
pub trait PhysicalStore: Send {
    fn upload(&mut self, slot: PhysicalSlot, tile: &TileData) -> Result<(), StoreError>;
}
