//! Tile addressing: keys into the virtual space and the space's bounds.
//!
//! A tile is addressed by `(x, y, mip)`. Mip 0 is the finest level; each
//! coarser level halves the tile grid in both dimensions, so the tile
//! `(x, y, m)` is covered by `(x >> d, y >> d, m + d)` for any `d`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Identity of a virtual tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub x: u32,
    pub y: u32,
    pub mip: u8,
}

impl TileKey {
    pub const fn new(x: u32, y: u32, mip: u8) -> Self {
        Self { x, y, mip }
    }

    /// The key covering this tile `levels` mips coarser.
    pub fn ancestor(&self, levels: u8) -> TileKey {
        let shift = u32::from(levels);
        TileKey {
            x: self.x.checked_shr(shift).unwrap_or(0),
            y: self.y.checked_shr(shift).unwrap_or(0),
            mip: self.mip.saturating_add(levels),
        }
    }

    /// The immediate coarser key.
    pub fn parent(&self) -> TileKey {
        self.ancestor(1)
    }
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})@mip{}", self.x, self.y, self.mip)
    }
}

/// Bounds of the virtual tile space.
///
/// `side_tiles` is the width (and height) of the mip-0 tile grid and must be
/// a power of two; the coarsest mip is the one where the grid is a single
/// tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpace {
    side_tiles: u32,
    max_mip: u8,
}

impl AddressSpace {
    /// Returns `None` if `side_tiles` is zero or not a power of two.
    pub fn new(side_tiles: u32) -> Option<Self> {
        if !side_tiles.is_power_of_two() {
            return None;
        }
        Some(Self {
            side_tiles,
            max_mip: side_tiles.trailing_zeros() as u8,
        })
    }

    pub fn side_tiles(&self) -> u32 {
        self.side_tiles
    }

    /// Coarsest mip level (a single tile covers the whole space).
    pub fn max_mip(&self) -> u8 {
        self.max_mip
    }

    /// Tile grid side at the given mip.
    pub fn side_at(&self, mip: u8) -> u32 {
        if mip > self.max_mip {
            return 0;
        }
        self.side_tiles >> mip
    }

    /// Whether `key` addresses a tile inside the space.
    pub fn contains(&self, key: &TileKey) -> bool {
        let side = self.side_at(key.mip);
        key.mip <= self.max_mip && key.x < side && key.y < side
    }
}

/// The tiles a frame needs, deduplicated, in first-seen order.
///
/// Doubles as the frame's protected set: nothing in it may be evicted while
/// the frame is being processed.
#[derive(Debug, Clone, Default)]
pub struct ProtectedSet {
    order: Vec<TileKey>,
    members: HashSet<TileKey>,
}

impl ProtectedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key; returns `false` if it was already present.
    pub fn insert(&mut self, key: TileKey) -> bool {
        if self.members.insert(key) {
            self.order.push(key);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.members.contains(key)
    }

    /// Keys in the order they were first inserted.
    pub fn iter(&self) -> impl Iterator<Item = &TileKey> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

impl FromIterator<TileKey> for ProtectedSet {
    fn from_iter<I: IntoIterator<Item = TileKey>>(iter: I) -> Self {
        let mut set = ProtectedSet::new();
        for key in iter {
            set.insert(key);
        }
        set
    }
}
