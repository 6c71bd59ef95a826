//! Virtual texture cache management.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`key`]: TileKey, AddressSpace and the per-frame ProtectedSet
//! - [`slot`]: Physical slot pool with eviction on acquire
//! - [`recency`]: O(1) least-recently-used ordering of resident tiles
//! - [`indirection`]: Virtual → physical table with mip fallback
//! - [`snapshot`]: Per-frame read-only view for the renderer
//! - [`manager`]: Frame-step orchestrator tying it all together

pub mod indirection;
pub mod key;
pub mod manager;
pub mod recency;
pub mod slot;
pub mod snapshot;
