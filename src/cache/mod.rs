//! Versioned cache generations.
//!
//! This module provides the storage side of the offline shell:
//! - Named generations, one per deployed version
//! - At most one entry per URL per generation (writes overwrite)
//! - Atomic bulk writes for install-time precaching
//! - Rejection of responses that must not be cached

mod generation;
mod storage;
mod traits;

pub use generation::GenerationCache;
pub use storage::SqliteStorage;
pub use traits::{CacheStorage, CachedEntry, DEFAULT_MAX_ENTRY_BYTES};
