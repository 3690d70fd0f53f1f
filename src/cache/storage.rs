//! SQLite implementation of the cache generation store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{check_cacheable, CacheStorage, CachedEntry};

/// SQLite-based cache storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  max_entry_bytes: usize,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path, max_entry_bytes: usize) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn, max_entry_bytes)
  }

  /// Private in-memory database.
  #[cfg(test)]
  pub fn in_memory(max_entry_bytes: usize) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn, max_entry_bytes)
  }

  fn with_connection(conn: Connection, max_entry_bytes: usize) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      max_entry_bytes,
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-shell").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per URL per generation
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (generation, url),
    FOREIGN KEY (generation) REFERENCES generations(name) ON DELETE CASCADE
);
"#;

fn insert_generation(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create cache generation {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, generation: &str, entry: &CachedEntry) -> Result<()> {
  let headers = serde_json::to_string(&entry.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (generation, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        generation,
        entry.url,
        entry.status,
        headers,
        entry.body,
        format_datetime(entry.cached_at)
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", entry.url, e))?;
  Ok(())
}

fn entry_from_row(
  url: String,
  status: u16,
  headers: String,
  body: Vec<u8>,
  cached_at: String,
) -> Result<CachedEntry> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;
  let cached_at = parse_datetime(&cached_at)?;

  Ok(CachedEntry {
    url,
    status,
    headers,
    body,
    cached_at,
  })
}

impl CacheStorage for SqliteStorage {
  fn open_generation(&self, name: &str) -> Result<()> {
    let conn = self.conn()?;
    insert_generation(&conn, name)
  }

  fn generation_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache generation: {}", e))?;

    Ok(names)
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE generation = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let deleted = tx
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn lookup(&self, generation: &str, url: &str) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE generation = ? AND url = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![generation, url], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", url, e))?;

    row
      .map(|(status, headers, body, cached_at)| {
        entry_from_row(url.to_string(), status, headers, body, cached_at)
      })
      .transpose()
  }

  fn put(&self, generation: &str, entry: &CachedEntry) -> Result<()> {
    check_cacheable(entry, self.max_entry_bytes)?;

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    insert_generation(&tx, generation)?;
    insert_entry(&tx, generation, entry)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_existing(&self, generation: &str, entry: &CachedEntry) -> Result<bool> {
    check_cacheable(entry, self.max_entry_bytes)?;

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    let exists = tx
      .query_row(
        "SELECT 1 FROM generations WHERE name = ?",
        params![generation],
        |_| Ok(()),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache generation {}: {}", generation, e))?
      .is_some();
    if !exists {
      return Ok(false);
    }

    insert_entry(&tx, generation, entry)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(true)
  }

  fn put_all(&self, generation: &str, entries: &[CachedEntry]) -> Result<()> {
    for entry in entries {
      check_cacheable(entry, self.max_entry_bytes)?;
    }

    let mut conn = self.conn()?;
    // Rolled back on drop if anything below fails
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    insert_generation(&tx, generation)?;
    for entry in entries {
      insert_entry(&tx, generation, entry)?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entries(&self, generation: &str) -> Result<Vec<CachedEntry>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT url, status, headers, body, cached_at FROM entries
         WHERE generation = ?
         ORDER BY url",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![generation], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries of {}: {}", generation, e))?
      .collect::<rusqlite::Result<Vec<(String, u16, String, Vec<u8>, String)>>>()
      .map_err(|e| eyre!("Failed to read entry of {}: {}", generation, e))?;

    rows
      .into_iter()
      .map(|(url, status, headers, body, cached_at)| {
        entry_from_row(url, status, headers, body, cached_at)
      })
      .collect()
  }
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::DEFAULT_MAX_ENTRY_BYTES;
  use crate::net::Response;

  fn storage() -> SqliteStorage {
    SqliteStorage::in_memory(DEFAULT_MAX_ENTRY_BYTES).unwrap()
  }

  fn entry(url: &str, body: &str) -> CachedEntry {
    CachedEntry::from_response(url, &Response::new(200, body).with_header("Content-Type", "text/plain"))
  }

  #[test]
  fn test_put_and_lookup() {
    let storage = storage();
    storage.put("v1", &entry("https://shell.test/a", "alpha")).unwrap();

    let found = storage.lookup("v1", "https://shell.test/a").unwrap().unwrap();
    assert_eq!(found.body, b"alpha");
    assert_eq!(found.status, 200);
    assert_eq!(
      found.headers,
      vec![("Content-Type".to_string(), "text/plain".to_string())]
    );
    assert!(storage.lookup("v1", "https://shell.test/b").unwrap().is_none());
    assert!(storage.lookup("v2", "https://shell.test/a").unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites_same_url() {
    let storage = storage();
    storage.put("v1", &entry("https://shell.test/a", "old")).unwrap();
    storage.put("v1", &entry("https://shell.test/a", "new")).unwrap();

    let entries = storage.entries("v1").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].body, b"new");
  }

  #[test]
  fn test_put_all_is_atomic() {
    let storage = SqliteStorage::in_memory(8).unwrap();
    let err = storage
      .put_all(
        "v1",
        &[
          entry("https://shell.test/small", "tiny"),
          entry("https://shell.test/big", "far too large"),
        ],
      )
      .unwrap_err();

    assert!(err.to_string().contains("exceeds"));
    assert!(storage.generation_names().unwrap().is_empty());
    assert!(storage.entries("v1").unwrap().is_empty());
  }

  #[test]
  fn test_put_existing_never_recreates_generation() {
    let storage = storage();
    assert!(!storage
      .put_existing("v1", &entry("https://shell.test/a", "late"))
      .unwrap());
    assert!(storage.generation_names().unwrap().is_empty());

    storage.open_generation("v1").unwrap();
    assert!(storage
      .put_existing("v1", &entry("https://shell.test/a", "a"))
      .unwrap());
    storage.delete_generation("v1").unwrap();
    assert!(!storage
      .put_existing("v1", &entry("https://shell.test/a", "again"))
      .unwrap());
    assert!(storage.generation_names().unwrap().is_empty());
    assert!(storage.entries("v1").unwrap().is_empty());
  }

  #[test]
  fn test_delete_generation_removes_entries() {
    let storage = storage();
    storage.put("v1", &entry("https://shell.test/a", "a")).unwrap();
    storage.put("v2", &entry("https://shell.test/a", "a")).unwrap();

    assert!(storage.delete_generation("v1").unwrap());
    assert!(!storage.delete_generation("v1").unwrap());
    assert_eq!(storage.generation_names().unwrap(), vec!["v2".to_string()]);
    assert!(storage.entries("v1").unwrap().is_empty());
  }

  #[test]
  fn test_open_generation_is_idempotent() {
    let storage = storage();
    storage.open_generation("v1").unwrap();
    storage.open_generation("v1").unwrap();
    assert_eq!(storage.generation_names().unwrap(), vec!["v1".to_string()]);
  }

  #[test]
  fn test_reopen_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open(&path, DEFAULT_MAX_ENTRY_BYTES).unwrap();
      storage.put("v1", &entry("https://shell.test/", "shell")).unwrap();
    }

    let storage = SqliteStorage::open(&path, DEFAULT_MAX_ENTRY_BYTES).unwrap();
    let found = storage.lookup("v1", "https://shell.test/").unwrap().unwrap();
    assert_eq!(found.body, b"shell");
  }
}
