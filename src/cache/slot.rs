//! Physical slot allocator.
//!
//! The physical cache is a fixed `side × side` grid of tile slots. Slots are
//! addressed by integer handle into an arena that records each slot's owner;
//! free slots sit on a FIFO free list so allocation and release are O(1).
//! When no slot is free, the least recently used unprotected resident tile
//! is evicted and its slot handed to the new owner.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cache::key::{ProtectedSet, TileKey};
use crate::cache::recency::RecencyTracker;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("Cache capacity exhausted: all {capacity} resident tiles are protected this frame")]
    CapacityExhausted { capacity: usize },

    #[error("Slot {slot} released twice")]
    DoubleRelease { slot: PhysicalSlot },

    #[error("Slot {slot} is outside the physical grid")]
    OutOfRange { slot: PhysicalSlot },

    #[error("Tile {key} already owns a slot")]
    AlreadyAssigned { key: TileKey },
}

/// A location in the physical slot grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysicalSlot {
    pub x: u16,
    pub y: u16,
}

impl PhysicalSlot {
    pub const fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }
}

impl std::fmt::Display for PhysicalSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.x, self.y)
    }
}

/// Result of a successful [`SlotAllocator::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    pub slot: PhysicalSlot,
    /// The resident tile evicted to make room, if the pool was full.
    pub evicted: Option<TileKey>,
}

/// Fixed-capacity pool of physical slots.
#[derive(Debug)]
pub struct SlotAllocator {
    side: u16,

    /// Owner of each slot, indexed by handle (`y * side + x`).
    owners: Vec<Option<TileKey>>,

    /// Free slot handles.
    free_list: VecDeque<u32>,

    /// Reverse map from owner to handle.
    assigned: HashMap<TileKey, u32>,
}

impl SlotAllocator {
    /// Create a pool of `side²` slots, all free.
    pub fn new(side: u16) -> Self {
        let capacity = usize::from(side) * usize::from(side);
        Self {
            side,
            owners: vec![None; capacity],
            free_list: (0..capacity as u32).collect(),
            assigned: HashMap::with_capacity(capacity),
        }
    }

    /// Hand a slot to `key`.
    ///
    /// Takes a free slot if there is one; otherwise evicts the least recently
    /// used resident tile outside `protected`, dropping it from `recency`.
    /// The caller must unbind the evicted key from the indirection table.
    pub fn acquire(
        &mut self,
        key: TileKey,
        protected: &ProtectedSet,
        recency: &mut RecencyTracker,
    ) -> Result<Acquired, SlotError> {
        if self.assigned.contains_key(&key) {
            crate::misuse!("tile {key} acquired a second slot");
            return Err(SlotError::AlreadyAssigned { key });
        }

        if let Some(handle) = self.free_list.pop_front() {
            self.assign(handle, key);
            return Ok(Acquired {
                slot: self.slot_at(handle),
                evicted: None,
            });
        }

        loop {
            let victim = recency
                .least_recent_unprotected(protected)
                .ok_or(SlotError::CapacityExhausted {
                    capacity: self.capacity(),
                })?;
            recency.remove(&victim);

            let Some(handle) = self.assigned.remove(&victim) else {
                // Tracked as recent but never held a slot; drop it and keep looking.
                crate::misuse!("recency tracker held {victim} without a slot");
                continue;
            };

            debug!(victim = %victim, key = %key, slot = %self.slot_at(handle), "Evicting tile");
            self.assign(handle, key);
            return Ok(Acquired {
                slot: self.slot_at(handle),
                evicted: Some(victim),
            });
        }
    }

    /// Return a slot to the free pool, yielding its former owner.
    pub fn release(&mut self, slot: PhysicalSlot) -> Result<TileKey, SlotError> {
        let handle = self.handle_of(slot).ok_or(SlotError::OutOfRange { slot })?;
        match self.owners[handle as usize].take() {
            Some(owner) => {
                self.assigned.remove(&owner);
                self.free_list.push_back(handle);
                Ok(owner)
            }
            None => {
                crate::misuse!("slot {slot} released twice");
                Err(SlotError::DoubleRelease { slot })
            }
        }
    }

    /// The slot currently held by `key`.
    pub fn slot_of(&self, key: &TileKey) -> Option<PhysicalSlot> {
        self.assigned.get(key).map(|&h| self.slot_at(h))
    }

    /// The key currently holding `slot`.
    pub fn owner(&self, slot: PhysicalSlot) -> Option<TileKey> {
        self.handle_of(slot)
            .and_then(|h| self.owners[h as usize])
    }

    pub fn capacity(&self) -> usize {
        self.owners.len()
    }

    pub fn side(&self) -> u16 {
        self.side
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    pub fn allocated(&self) -> usize {
        self.assigned.len()
    }

    fn assign(&mut self, handle: u32, key: TileKey) {
        self.owners[handle as usize] = Some(key);
        self.assigned.insert(key, handle);
    }

    fn slot_at(&self, handle: u32) -> PhysicalSlot {
        let side = u32::from(self.side);
        PhysicalSlot {
            x: (handle % side) as u16,
            y: (handle / side) as u16,
        }
    }

    fn handle_of(&self, slot: PhysicalSlot) -> Option<u32> {
        if slot.x >= self.side || slot.y >= self.side {
            return None;
        }
        Some(u32::from(slot.y) * u32::from(self.side) + u32::from(slot.x))
    }
}
