//! Feedback providers: which tiles the current view needs.
//!
//! Real renderers read this back from a feedback pass; the providers here
//! model a camera for the simulator and replay fixed lists for tests.

use std::collections::HashSet;

use crate::cache::key::{AddressSpace, TileKey};

/// Produces, once per frame, a duplicate-free list of needed tiles.
pub trait FeedbackProvider {
    fn needed_tiles(&mut self, frame: u64) -> Vec<TileKey>;
}

/// A square window of tiles panning across the virtual space.
///
/// Also requests the window's coarser ancestors up to `fallback_levels`
/// mips, which keeps a low-resolution backdrop resident while the fine
/// tiles stream in.
#[derive(Debug, Clone)]
pub struct ViewportFeedback {
    space: AddressSpace,
    mip: u8,
    view_tiles: u32,
    pan_speed: u32,
    fallback_levels: u8,
}

impl ViewportFeedback {
    pub fn new(space: AddressSpace, mip: u8, view_tiles: u32, pan_speed: u32) -> Self {
        Self {
            space,
            mip: mip.min(space.max_mip()),
            view_tiles,
            pan_speed,
            fallback_levels: 0,
        }
    }

    pub fn with_fallback_levels(mut self, levels: u8) -> Self {
        self.fallback_levels = levels;
        self
    }

    /// Top-left tile of the window at `frame`, wrapping at the space edge.
    pub fn origin(&self, frame: u64) -> (u32, u32) {
        let side = u64::from(self.space.side_at(self.mip).max(1));
        let x = (frame * u64::from(self.pan_speed)) % side;
        (x as u32, 0)
    }
}

impl FeedbackProvider for ViewportFeedback {
    fn needed_tiles(&mut self, frame: u64) -> Vec<TileKey> {
        let side = self.space.side_at(self.mip);
        let span = self.view_tiles.min(side);
        let (ox, oy) = self.origin(frame);

        let mut seen = HashSet::new();
        let mut needed = Vec::new();
        for dy in 0..span {
            for dx in 0..span {
                let key = TileKey::new((ox + dx) % side, (oy + dy) % side, self.mip);
                for levels in 0..=self.fallback_levels {
                    let candidate = key.ancestor(levels);
                    if self.space.contains(&candidate) && seen.insert(candidate) {
                        needed.push(candidate);
                    }
                }
            }
        }
        needed
    }
}

/// Replays a fixed needed-list every frame.
#[derive(Debug, Clone, Default)]
pub struct StaticFeedback {
    tiles: Vec<TileKey>,
}

impl StaticFeedback {
    pub fn new(tiles: Vec<TileKey>) -> Self {
        let mut seen = HashSet::new();
        let tiles = tiles.into_iter().filter(|k| seen.insert(*k)).collect();
        Self { tiles }
    }
}

impl FeedbackProvider for StaticFeedback {
    fn needed_tiles(&mut self, _frame: u64) -> Vec<TileKey> {
        self.tiles.clone()
    }
}
