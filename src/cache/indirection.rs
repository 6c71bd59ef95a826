//! Indirection (page) table: virtual tile → physical slot.
//!
//! Every key the cache knows about has exactly one entry. A `Loading` entry
//! is a placeholder while the tile is fetched and never carries a slot; a
//! `Resident` entry always does. Lookups that miss fall back to the nearest
//! resident ancestor so a fine tile still in flight samples its coarser
//! parent instead of a hole.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::key::TileKey;
use crate::cache::slot::PhysicalSlot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("Tile {key} is already resident in slot {slot}")]
    AlreadyResident { key: TileKey, slot: PhysicalSlot },

    #[error("Slot {slot} is already bound to tile {owner}")]
    SlotTaken { slot: PhysicalSlot, owner: TileKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Residency {
    Loading,
    Resident { slot: PhysicalSlot },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectionEntry {
    pub key: TileKey,
    pub residency: Residency,
    pub last_touched_frame: u64,
}

impl IndirectionEntry {
    pub fn slot(&self) -> Option<PhysicalSlot> {
        match self.residency {
            Residency::Resident { slot } => Some(slot),
            Residency::Loading => None,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.residency, Residency::Resident { .. })
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.residency, Residency::Loading)
    }
}

/// Where to sample for a requested key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Fallback {
    /// The resident key actually sampled (the request itself or an ancestor).
    pub source: TileKey,
    pub slot: PhysicalSlot,
    /// How many requested tiles span one sampled tile per axis (`2^levels`).
    pub scale_factor: u32,
    /// Position of the requested tile inside the sampled one, in `[0, 1)`.
    pub offset: [f32; 2],
}

impl Fallback {
    pub fn mip_used(&self) -> u8 {
        self.source.mip
    }

    pub fn is_exact(&self) -> bool {
        self.scale_factor == 1
    }
}

/// The page table.
#[derive(Debug)]
pub struct IndirectionTable {
    entries: HashMap<TileKey, IndirectionEntry>,
    by_slot: HashMap<PhysicalSlot, TileKey>,
    max_mip: u8,
}

impl IndirectionTable {
    pub fn new(max_mip: u8) -> Self {
        Self {
            entries: HashMap::new(),
            by_slot: HashMap::new(),
            max_mip,
        }
    }

    pub fn lookup(&self, key: &TileKey) -> Option<&IndirectionEntry> {
        self.entries.get(key)
    }

    /// Resolve `key` to the finest resident tile covering it.
    pub fn lookup_with_fallback(&self, key: &TileKey) -> Option<Fallback> {
        if key.mip > self.max_mip {
            return None;
        }
        (0..=self.max_mip - key.mip).find_map(|levels| {
            let candidate = key.ancestor(levels);
            let slot = self.entries.get(&candidate)?.slot()?;
            let scale = 1u32 << levels;
            let mask = scale - 1;
            Some(Fallback {
                source: candidate,
                slot,
                scale_factor: scale,
                offset: [
                    (key.x & mask) as f32 / scale as f32,
                    (key.y & mask) as f32 / scale as f32,
                ],
            })
        })
    }

    /// Create a loading placeholder for `key`. Existing entries are left alone.
    pub fn mark_loading(&mut self, key: TileKey, frame: u64) -> &IndirectionEntry {
        self.entries.entry(key).or_insert(IndirectionEntry {
            key,
            residency: Residency::Loading,
            last_touched_frame: frame,
        })
    }

    /// Make `key` resident in `slot`.
    pub fn bind(&mut self, key: TileKey, slot: PhysicalSlot, frame: u64) -> Result<(), BindError> {
        if let Some(owner) = self.by_slot.get(&slot) {
            if *owner != key {
                crate::misuse!("slot {slot} bound to {key} while owned by {owner}");
                return Err(BindError::SlotTaken { slot, owner: *owner });
            }
        }
        if let Some(IndirectionEntry {
            residency: Residency::Resident { slot: current },
            ..
        }) = self.entries.get(&key)
        {
            crate::misuse!("tile {key} bound twice");
            return Err(BindError::AlreadyResident { key, slot: *current });
        }

        self.entries.insert(
            key,
            IndirectionEntry {
                key,
                residency: Residency::Resident { slot },
                last_touched_frame: frame,
            },
        );
        self.by_slot.insert(slot, key);
        Ok(())
    }

    /// Remove `key`'s entry entirely.
    pub fn unbind(&mut self, key: &TileKey) -> Option<IndirectionEntry> {
        let entry = self.entries.remove(key)?;
        if let Some(slot) = entry.slot() {
            self.by_slot.remove(&slot);
        }
        Some(entry)
    }

    /// Record that `key` was needed in `frame`.
    pub fn touch(&mut self, key: &TileKey, frame: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_touched_frame = frame;
        }
    }

    /// Loading entries last needed more than `grace` frames before `frame`.
    pub fn stale_loading(&self, frame: u64, grace: u64) -> Vec<TileKey> {
        let mut stale: Vec<TileKey> = self
            .entries
            .values()
            .filter(|e| e.is_loading() && frame.saturating_sub(e.last_touched_frame) > grace)
            .map(|e| e.key)
            .collect();
        stale.sort();
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resident_count(&self) -> usize {
        self.by_slot.len()
    }

    pub fn loading_count(&self) -> usize {
        self.entries.len() - self.by_slot.len()
    }

    pub fn max_mip(&self) -> u8 {
        self.max_mip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_then_lookup_round_trip() {
        let mut table = IndirectionTable::new(4);
        let key = TileKey::new(3, 5, 0);
        let slot = PhysicalSlot::new(1, 2);

        table.mark_loading(key, 1);
        assert!(table.lookup(&key).unwrap().is_loading());
        assert_eq!(table.lookup(&key).unwrap().slot(), None);

        table.bind(key, slot, 2).unwrap();
        let entry = table.lookup(&key).unwrap();
        assert_eq!(entry.residency, Residency::Resident { slot });
        assert_eq!(entry.last_touched_frame, 2);
        assert_eq!(table.resident_count(), 1);
        assert_eq!(table.loading_count(), 0);
    }

    #[test]
    fn test_fallback_to_parent_with_scale_two() {
        let mut table = IndirectionTable::new(4);
        let child = TileKey::new(5, 2, 1);
        let parent = child.parent();
        let slot = PhysicalSlot::new(0, 3);

        table.bind(parent, slot, 0).unwrap();
        table.mark_loading(child, 0);

        let fb = table.lookup_with_fallback(&child).unwrap();
        assert_eq!(fb.source, parent);
        assert_eq!(fb.slot, slot);
        assert_eq!(fb.scale_factor, 2);
        assert_eq!(fb.mip_used(), 2);
        assert_eq!(fb.offset, [0.5, 0.0]);
    }

    #[test]
    fn test_fallback_skips_loading_ancestors() {
        let mut table = IndirectionTable::new(3);
        let key = TileKey::new(7, 7, 0);
        table.mark_loading(key.ancestor(1), 0);
        table.bind(key.ancestor(3), PhysicalSlot::new(0, 0), 0).unwrap();

        let fb = table.lookup_with_fallback(&key).unwrap();
        assert_eq!(fb.source, TileKey::new(0, 0, 3));
        assert_eq!(fb.scale_factor, 8);
        assert_eq!(fb.offset, [0.875, 0.875]);
    }

    #[test]
    fn test_exact_hit_has_unit_scale() {
        let mut table = IndirectionTable::new(2);
        let key = TileKey::new(1, 1, 0);
        table.bind(key, PhysicalSlot::new(2, 2), 0).unwrap();
        let fb = table.lookup_with_fallback(&key).unwrap();
        assert!(fb.is_exact());
        assert_eq!(fb.offset, [0.0, 0.0]);
    }

    #[test]
    fn test_fallback_miss_when_nothing_resident() {
        let table = IndirectionTable::new(2);
        assert!(table.lookup_with_fallback(&TileKey::new(0, 0, 0)).is_none());
        assert!(table.lookup_with_fallback(&TileKey::new(0, 0, 9)).is_none());
    }

    #[test]
    fn test_unbind_frees_slot_mapping() {
        let mut table = IndirectionTable::new(2);
        let a = TileKey::new(0, 0, 0);
        let b = TileKey::new(1, 0, 0);
        let slot = PhysicalSlot::new(0, 0);
        table.bind(a, slot, 0).unwrap();
        assert!(table.unbind(&a).is_some());
        assert!(table.lookup(&a).is_none());
        table.bind(b, slot, 0).unwrap();
        assert_eq!(table.lookup(&b).unwrap().slot(), Some(slot));
    }

    #[test]
    fn test_stale_loading_respects_grace() {
        let mut table = IndirectionTable::new(2);
        let key = TileKey::new(0, 0, 0);
        table.mark_loading(key, 10);
        assert!(table.stale_loading(12, 2).is_empty());
        assert_eq!(table.stale_loading(13, 2), vec![key]);
        table.touch(&key, 13);
        assert!(table.stale_loading(13, 2).is_empty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "bound twice")]
    fn test_double_bind_panics_in_debug() {
        let mut table = IndirectionTable::new(2);
        let key = TileKey::new(0, 0, 0);
        table.bind(key, PhysicalSlot::new(0, 0), 0).unwrap();
        let _ = table.bind(key, PhysicalSlot::new(1, 0), 0);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_double_bind_is_rejected_in_release() {
        let mut table = IndirectionTable::new(2);
        let key = TileKey::new(0, 0, 0);
        let slot = PhysicalSlot::new(0, 0);
        table.bind(key, slot, 0).unwrap();
        assert_eq!(
            table.bind(key, PhysicalSlot::new(1, 0), 0),
            Err(BindError::AlreadyResident { key, slot })
        );
        assert_eq!(table.lookup(&key).unwrap().slot(), Some(slot));
    }
}
