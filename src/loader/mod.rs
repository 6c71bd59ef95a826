//! Asynchronous tile loading.
//!
//! - [`source`]: the TileSource seam, TileData, and a procedural source
//! - [`disk`]: tiles read from a directory tree (optionally zstd-packed)
//! - [`scripted`]: a source resolved by hand, for deterministic driving
//! - [`scheduler`]: deduplicated, cancellable fetch requests and the
//!   per-frame completion drain

pub mod disk;
pub mod scheduler;
pub mod scripted;
pub mod source;
