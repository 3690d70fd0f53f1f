//! Core traits and types for the cache generation store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};

use crate::net::{Response, ResponseSource};

/// Default cap on a single cached body (5 MiB).
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 5 * 1024 * 1024;

/// A response snapshot stored in a generation, keyed by request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  /// Absolute request URL without fragment
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
  /// Snapshot `response` under `url`.
  pub fn from_response(url: impl Into<String>, response: &Response) -> Self {
    Self {
      url: url.into(),
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      cached_at: Utc::now(),
    }
  }

  /// Turn the snapshot back into a response for the page.
  pub fn into_response(self, source: ResponseSource) -> Response {
    Response {
      status: self.status,
      headers: self.headers,
      body: self.body,
      source,
    }
  }

  /// Hex SHA-256 of the body.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&self.body);
    hex::encode(hasher.finalize())
  }
}

/// Trait for cache generation backends.
///
/// Every entry lives in exactly one named generation and is unique by URL
/// within it. Writes to an existing URL replace the previous entry.
pub trait CacheStorage: Send + Sync {
  /// Create the generation if it doesn't exist yet.
  fn open_generation(&self, name: &str) -> Result<()>;

  /// Names of all existing generations, sorted.
  fn generation_names(&self) -> Result<Vec<String>>;

  /// Delete a generation and all of its entries. Returns whether it existed.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  /// Look up the entry stored for `url`.
  fn lookup(&self, generation: &str, url: &str) -> Result<Option<CachedEntry>>;

  /// Insert or replace a single entry, creating the generation if needed.
  fn put(&self, generation: &str, entry: &CachedEntry) -> Result<()>;

  /// Insert or replace a single entry only while the generation exists.
  /// Returns `false`, writing nothing, once the generation has been deleted.
  fn put_existing(&self, generation: &str, entry: &CachedEntry) -> Result<bool>;

  /// Insert or replace all entries at once. Nothing is written if any entry
  /// is rejected.
  fn put_all(&self, generation: &str, entries: &[CachedEntry]) -> Result<()>;

  /// All entries of a generation ordered by URL.
  fn entries(&self, generation: &str) -> Result<Vec<CachedEntry>>;
}

/// Reject responses that must not be stored.
pub fn check_cacheable(entry: &CachedEntry, max_entry_bytes: usize) -> Result<()> {
  if entry.status == 206 {
    return Err(eyre!("Refusing to cache partial response for {}", entry.url));
  }

  let vary_all = entry
    .headers
    .iter()
    .filter(|(name, _)| name.eq_ignore_ascii_case("vary"))
    .any(|(_, value)| value.split(',').any(|v| v.trim() == "*"));
  if vary_all {
    return Err(eyre!("Refusing to cache {} (Vary: *)", entry.url));
  }

  if entry.body.len() > max_entry_bytes {
    return Err(eyre!(
      "Refusing to cache {}: {} bytes exceeds the {} byte limit",
      entry.url,
      entry.body.len(),
      max_entry_bytes
    ));
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(status: u16, body: &str) -> CachedEntry {
    CachedEntry::from_response("https://shell.test/a", &Response::new(status, body))
  }

  #[test]
  fn test_partial_content_not_cacheable() {
    assert!(check_cacheable(&entry(206, "x"), 1024).is_err());
  }

  #[test]
  fn test_vary_star_not_cacheable() {
    let mut e = entry(200, "x");
    e.headers.push(("Vary".into(), "Accept, *".into()));
    assert!(check_cacheable(&e, 1024).is_err());

    let mut e = entry(200, "x");
    e.headers.push(("Vary".into(), "Accept-Encoding".into()));
    assert!(check_cacheable(&e, 1024).is_ok());
  }

  #[test]
  fn test_oversized_body_not_cacheable() {
    assert!(check_cacheable(&entry(200, "12345"), 4).is_err());
    assert!(check_cacheable(&entry(200, "1234"), 4).is_ok());
  }

  #[test]
  fn test_error_statuses_are_cacheable() {
    assert!(check_cacheable(&entry(404, "missing"), 1024).is_ok());
  }

  #[test]
  fn test_digest_tracks_body() {
    let a = entry(200, "one");
    let b = entry(200, "two");
    assert_ne!(a.digest(), b.digest());
    assert_eq!(a.digest(), entry(200, "one").digest());
    assert_eq!(a.digest().len(), 64);
  }
}
