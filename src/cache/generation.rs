//! Handle on a single named cache generation.

use color_eyre::Result;
use std::sync::Arc;

use super::traits::{CacheStorage, CachedEntry};

/// One named generation of a shared storage backend.
///
/// Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct GenerationCache {
  storage: Arc<dyn CacheStorage>,
  name: String,
}

impl GenerationCache {
  pub fn new(storage: Arc<dyn CacheStorage>, name: impl Into<String>) -> Self {
    Self {
      storage,
      name: name.into(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn open(&self) -> Result<()> {
    self.storage.open_generation(&self.name)
  }

  pub fn lookup(&self, url: &str) -> Result<Option<CachedEntry>> {
    self.storage.lookup(&self.name, url)
  }

  /// Write `entry` unless the generation has been deleted meanwhile.
  pub fn put_existing(&self, entry: &CachedEntry) -> Result<bool> {
    self.storage.put_existing(&self.name, entry)
  }

  pub fn put_all(&self, entries: &[CachedEntry]) -> Result<()> {
    self.storage.put_all(&self.name, entries)
  }

  /// Delete every other generation in the backend. Returns the removed names.
  pub fn delete_others(&self) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for name in self.storage.generation_names()? {
      if name != self.name && self.storage.delete_generation(&name)? {
        removed.push(name);
      }
    }
    Ok(removed)
  }
}
