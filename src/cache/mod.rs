//! Versioned response caches for offline availability.
//!
//! This module provides:
//! - Named caches keyed by generation, evicted wholesale on activation
//! - Cache-first, stale-while-revalidate, network-first and network-only
//!   strategies
//! - A single write path that refuses credentialed or user-specific responses

mod layer;
mod storage;
mod traits;

pub use layer::{api_cache, static_cache, CacheManager};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Strategy};
