//! Per-frame read-only view of the indirection table.
//!
//! The renderer samples through this: for every key requested this frame it
//! says which slot to read and how to remap texture coordinates when the
//! slot holds a coarser ancestor. A snapshot is only meaningful for the frame
//! that produced it.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use serde::Serialize;

use crate::cache::indirection::Fallback;
use crate::cache::key::TileKey;

/// Where a requested tile should be sampled from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleLocation {
    /// Top-left of the sampled slot in atlas UV space.
    pub normalized_slot: [f32; 2],
    /// `2^levels` when sampling an ancestor `levels` mips coarser.
    pub scale_factor: u32,
    /// Position of the requested tile inside the sampled slot, in `[0, 1)`.
    pub offset: [f32; 2],
    pub mip_used: u8,
}

impl SampleLocation {
    pub fn from_fallback(fallback: &Fallback, cache_side: u16) -> Self {
        let side = f32::from(cache_side.max(1));
        Self {
            normalized_slot: [f32::from(fallback.slot.x) / side, f32::from(fallback.slot.y) / side],
            scale_factor: fallback.scale_factor,
            offset: fallback.offset,
            mip_used: fallback.source.mip,
        }
    }
}

/// GPU layout of one snapshot record, in request order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuIndirectionEntry {
    pub slot_uv: [f32; 2],
    pub offset: [f32; 2],
    /// Reciprocal of the scale factor, ready to multiply into UVs.
    pub inv_scale: f32,
    pub mip_used: u32,
    /// 0 when nothing covering the tile is resident.
    pub valid: u32,
    pub _pad: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndirectionSnapshot {
    frame: u64,
    order: Vec<TileKey>,
    #[serde(skip)]
    entries: HashMap<TileKey, Option<SampleLocation>>,
}

impl IndirectionSnapshot {
    pub(crate) fn new(frame: u64) -> Self {
        Self {
            frame,
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, key: TileKey, location: Option<SampleLocation>) {
        if self.entries.insert(key, location).is_none() {
            self.order.push(key);
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Sample location for a key requested this frame.
    ///
    /// `None` for a requested key means nothing covering it is resident yet.
    /// Asking about a key that was not requested is a caller bug.
    pub fn resolve(&self, key: &TileKey) -> Option<SampleLocation> {
        match self.entries.get(key) {
            Some(location) => *location,
            None => {
                crate::misuse!("snapshot for frame {} queried for unrequested tile {key}", self.frame);
                None
            }
        }
    }

    /// Whether `key` was requested in this snapshot's frame.
    pub fn covers(&self, key: &TileKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Requested keys in request order.
    pub fn keys(&self) -> &[TileKey] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Requested keys whose own tile is resident.
    pub fn exact_count(&self) -> usize {
        self.entries
            .values()
            .filter(|l| matches!(l, Some(loc) if loc.scale_factor == 1))
            .count()
    }

    /// Pack the snapshot for upload, one record per requested key in order.
    pub fn to_gpu_entries(&self) -> Vec<GpuIndirectionEntry> {
        self.order
            .iter()
            .map(|key| match self.entries.get(key).copied().flatten() {
                Some(loc) => GpuIndirectionEntry {
                    slot_uv: loc.normalized_slot,
                    offset: loc.offset,
                    inv_scale: 1.0 / loc.scale_factor as f32,
                    mip_used: u32::from(loc.mip_used),
                    valid: 1,
                    _pad: 0,
                },
                None => GpuIndirectionEntry::zeroed(),
            })
            .collect()
    }

    /// [`to_gpu_entries`](Self::to_gpu_entries) as raw bytes.
    pub fn to_gpu_bytes(&self) -> Vec<u8> {
        let entries = self.to_gpu_entries();
        bytemuck::cast_slice::<GpuIndirectionEntry, u8>(&entries).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::slot::PhysicalSlot;

    fn fallback(slot: PhysicalSlot, source: TileKey, scale: u32) -> Fallback {
        Fallback {
            source,
            slot,
            scale_factor: scale,
            offset: [0.5, 0.0],
        }
    }

    #[test]
    fn test_sample_location_normalizes_slot() {
        let fb = fallback(PhysicalSlot::new(2, 1), TileKey::new(0, 0, 1), 2);
        let loc = SampleLocation::from_fallback(&fb, 4);
        assert_eq!(loc.normalized_slot, [0.5, 0.25]);
        assert_eq!(loc.scale_factor, 2);
        assert_eq!(loc.mip_used, 1);
    }

    #[test]
    fn test_gpu_entries_follow_request_order() {
        let a = TileKey::new(0, 0, 0);
        let b = TileKey::new(1, 0, 0);
        let mut snap = IndirectionSnapshot::new(3);
        snap.insert(b, None);
        snap.insert(
            a,
            Some(SampleLocation::from_fallback(
                &fallback(PhysicalSlot::new(1, 0), a.parent(), 2),
                2,
            )),
        );

        let gpu = snap.to_gpu_entries();
        assert_eq!(gpu.len(), 2);
        assert_eq!(gpu[0].valid, 0);
        assert_eq!(gpu[1].valid, 1);
        assert_eq!(gpu[1].inv_scale, 0.5);
        assert_eq!(gpu[1].slot_uv, [0.5, 0.0]);
        assert_eq!(snap.to_gpu_bytes().len(), 2 * std::mem::size_of::<GpuIndirectionEntry>());
        assert_eq!(std::mem::size_of::<GpuIndirectionEntry>(), 32);
    }

    #[test]
    fn test_requested_but_uncovered_resolves_none() {
        let key = TileKey::new(5, 5, 0);
        let mut snap = IndirectionSnapshot::new(1);
        snap.insert(key, None);
        assert!(snap.covers(&key));
        assert_eq!(snap.resolve(&key), None);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unrequested tile")]
    fn test_unrequested_lookup_panics_in_debug() {
        let snap = IndirectionSnapshot::new(1);
        snap.resolve(&TileKey::new(0, 0, 0));
    }
}
