//! vtex-cache: demand-paged virtual texture tile cache.
//!
//! Maps an effectively unbounded virtual space of texture tiles onto a fixed
//! pool of physical slots:
//!   feedback (needed tiles) → load scheduler (async fetch) → slot pool
//!
//! Tiles that are not resident yet are sampled through their nearest
//! resident coarser mip, so the renderer always has something to draw.

/// Report a caller contract violation.
///
/// Panics in debug builds; release builds log at error level and the caller
/// returns an error instead.
macro_rules! misuse {
    ($($arg:tt)+) => {{
        ::tracing::error!($($arg)+);
        debug_assert!(false, $($arg)+);
    }};
}
pub(crate) use misuse;

pub mod cache;
pub mod config;
pub mod feedback;
pub mod loader;
pub mod metrics;
pub mod server;
pub mod store;
