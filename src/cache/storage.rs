//! Cache storage trait with SQLite and in-memory implementations.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CacheEntryInfo, CachedResponse};
use crate::fetch::Response;

/// Trait for cache storage backends.
///
/// Entries are grouped by cache name and keyed by request URL. Writing an
/// existing key replaces it; nothing is ever evicted.
pub trait CacheStorage: Send + Sync {
  /// Store a single response.
  fn put(&self, cache: &str, url: &str, response: &Response) -> Result<()>;

  /// Store a batch of responses. Either all entries are written or none are.
  fn put_all(&self, cache: &str, entries: &[(String, Response)]) -> Result<()>;

  /// Look up the response stored for a URL.
  fn match_url(&self, cache: &str, url: &str) -> Result<Option<CachedResponse>>;

  /// List every entry in a cache, ordered by URL.
  fn entries(&self, cache: &str) -> Result<Vec<CacheEntryInfo>>;

  /// URLs stored in a cache, ordered.
  #[cfg(test)]
  fn keys(&self, cache: &str) -> Result<Vec<String>> {
    Ok(self.entries(cache)?.into_iter().map(|e| e.url).collect())
  }
}

/// Storage that keeps everything in process memory.
/// Used for ephemeral runs and tests.
#[derive(Default)]
pub struct MemoryStorage {
  caches: Mutex<HashMap<String, BTreeMap<String, CachedResponse>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(
    &self,
  ) -> Result<std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, CachedResponse>>>> {
    self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn put(&self, cache: &str, url: &str, response: &Response) -> Result<()> {
    self.put_all(cache, &[(url.to_string(), response.clone())])
  }

  fn put_all(&self, cache: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut caches = self.lock()?;
    let store = caches.entry(cache.to_string()).or_default();
    let now = Utc::now();

    for (url, response) in entries {
      store.insert(
        url.clone(),
        CachedResponse {
          url: url.clone(),
          response: response.clone(),
          cached_at: now,
        },
      );
    }

    Ok(())
  }

  fn match_url(&self, cache: &str, url: &str) -> Result<Option<CachedResponse>> {
    let caches = self.lock()?;
    Ok(caches.get(cache).and_then(|store| store.get(url)).cloned())
  }

  fn entries(&self, cache: &str) -> Result<Vec<CacheEntryInfo>> {
    let caches = self.lock()?;
    Ok(
      caches
        .get(cache)
        .map(|store| {
          store
            .values()
            .map(|entry| CacheEntryInfo {
              url: entry.url.clone(),
              status: entry.response.status,
              cached_at: entry.cached_at,
            })
            .collect()
        })
        .unwrap_or_default(),
    )
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A private database that lives as long as the storage value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("navcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per (cache name, request URL); url_hash keeps the key fixed-length
CREATE TABLE IF NOT EXISTS response_cache (
    cache_name TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers BLOB NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, url_hash)
);

CREATE INDEX IF NOT EXISTS idx_response_cache_url
    ON response_cache(cache_name, url);
"#;

const UPSERT_RESPONSE: &str =
  "INSERT OR REPLACE INTO response_cache (cache_name, url_hash, url, status, headers, body, cached_at)
   VALUES (?, ?, ?, ?, ?, ?, datetime('now'))";

impl CacheStorage for SqliteStorage {
  fn put(&self, cache: &str, url: &str, response: &Response) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let headers = serde_json::to_vec(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        UPSERT_RESPONSE,
        params![
          cache,
          url_hash(url),
          url,
          response.status,
          headers,
          &response.body[..]
        ],
      )
      .map_err(|e| eyre!("Failed to store response for {}: {}", url, e))?;

    Ok(())
  }

  fn put_all(&self, cache: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Dropping the transaction without commit rolls everything back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (url, response) in entries {
      let headers = serde_json::to_vec(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        UPSERT_RESPONSE,
        params![
          cache,
          url_hash(url),
          url,
          response.status,
          headers,
          &response.body[..]
        ],
      )
      .map_err(|e| eyre!("Failed to store response for {}: {}", url, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_url(&self, cache: &str, url: &str) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, Vec<u8>, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM response_cache
         WHERE cache_name = ? AND url_hash = ?",
        params![cache, url_hash(url)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache for {}: {}", url, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_slice(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;

        Ok(Some(CachedResponse {
          url: url.to_string(),
          response: Response {
            status,
            headers,
            body: Bytes::from(body),
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn entries(&self, cache: &str) -> Result<Vec<CacheEntryInfo>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT url, status, cached_at FROM response_cache
         WHERE cache_name = ?
         ORDER BY url",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, u16, String)> = stmt
      .query_map(params![cache], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .map_err(|e| eyre!("Failed to list cache entries: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    rows
      .into_iter()
      .map(|(url, status, cached_at)| {
        Ok(CacheEntryInfo {
          url,
          status,
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }
}

/// SHA256 hash for stable, fixed-length keys.
fn url_hash(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
