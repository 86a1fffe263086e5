//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::net::{HttpRequest, HttpResponse};

use super::registration::{LifecycleState, Registration};
use super::traits::{request_key, CachedResponse};

/// Named cache stores plus the registration record.
///
/// Every method is atomic on its own; concurrent writers to the same key are
/// last-writer-wins.
pub trait CacheStorage: Send + Sync {
  /// Create the named store if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  fn has(&self, name: &str) -> Result<bool>;

  /// Names of all stores, sorted.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a store and all its entries. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look up a request in the named store.
  fn match_request(&self, name: &str, request: &HttpRequest) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any prior entry for the same request.
  ///
  /// Only writes into a store that already exists; returns false when the
  /// store is missing (for example purged by an activate in the meantime).
  fn put(&self, name: &str, request: &HttpRequest, response: &HttpResponse) -> Result<bool>;

  /// Store a batch of responses in one transaction: all or nothing.
  fn put_all(&self, name: &str, entries: &[(HttpRequest, HttpResponse)]) -> Result<()>;

  fn entry_count(&self, name: &str) -> Result<usize>;

  /// App shell fingerprint recorded when the store was last installed.
  fn fingerprint(&self, name: &str) -> Result<Option<String>>;

  fn set_fingerprint(&self, name: &str, fingerprint: &str) -> Result<()>;

  fn load_registration(&self) -> Result<Registration>;

  fn save_registration(&self, registration: &Registration) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per named cache store (one per generation)
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    shell_fingerprint TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by request hash
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key),
    FOREIGN KEY (cache_name) REFERENCES cache_stores(name) ON DELETE CASCADE
);

-- Singleton lifecycle record
CREATE TABLE IF NOT EXISTS registration (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    state TEXT NOT NULL,
    active_generation TEXT,
    waiting_generation TEXT
);
"#;

fn insert_store(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open cache store {}: {}", name, e))?;
  Ok(())
}

fn store_exists(conn: &Connection, name: &str) -> Result<bool> {
  let found: Option<i64> = conn
    .query_row(
      "SELECT 1 FROM cache_stores WHERE name = ?",
      params![name],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to look up cache store {}: {}", name, e))?;
  Ok(found.is_some())
}

fn insert_entry(
  conn: &Connection,
  name: &str,
  request: &HttpRequest,
  response: &HttpResponse,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, request_key, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        request_key(request),
        request.method,
        request.url.as_str(),
        response.status,
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", request.url, name, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    insert_store(&conn, name)
  }

  fn has(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    store_exists(&conn, name)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_request(&self, name: &str, request: &HttpRequest) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![name, request_key(request)], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", request.url, name, e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedResponse {
          response: HttpResponse {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, name: &str, request: &HttpRequest, response: &HttpResponse) -> Result<bool> {
    // Existence check and write share the lock, so a concurrent delete
    // cannot land in between.
    let conn = self.lock()?;
    if !store_exists(&conn, name)? {
      return Ok(false);
    }
    insert_entry(&conn, name, request, response)?;
    Ok(true)
  }

  fn put_all(&self, name: &str, entries: &[(HttpRequest, HttpResponse)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_store(&tx, name)?;
    for (request, response) in entries {
      insert_entry(&tx, name, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", name, e))?;
    Ok(count as usize)
  }

  fn fingerprint(&self, name: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    let result: Option<Option<String>> = conn
      .query_row(
        "SELECT shell_fingerprint FROM cache_stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read fingerprint of {}: {}", name, e))?;
    Ok(result.flatten())
  }

  fn set_fingerprint(&self, name: &str, fingerprint: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE cache_stores SET shell_fingerprint = ? WHERE name = ?",
        params![fingerprint, name],
      )
      .map_err(|e| eyre!("Failed to record fingerprint of {}: {}", name, e))?;
    Ok(())
  }

  fn load_registration(&self) -> Result<Registration> {
    let conn = self.lock()?;
    let row: Option<(String, Option<String>, Option<String>)> = conn
      .query_row(
        "SELECT state, active_generation, waiting_generation FROM registration WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to load registration: {}", e))?;

    match row {
      Some((state, active, waiting)) => Ok(Registration {
        state: state.parse::<LifecycleState>()?,
        active,
        waiting,
      }),
      None => Ok(Registration::default()),
    }
  }

  fn save_registration(&self, registration: &Registration) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO registration (id, state, active_generation, waiting_generation)
         VALUES (1, ?, ?, ?)",
        params![
          registration.state.as_str(),
          registration.active,
          registration.waiting,
        ],
      )
      .map_err(|e| eyre!("Failed to save registration: {}", e))?;
    Ok(())
  }
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
  use url::Url;

  fn get(path: &str) -> HttpRequest {
    HttpRequest::get(Url::parse("http://localhost:8000").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_put_then_match() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("v1").unwrap();
    let mut response = HttpResponse::new(200, "body { color: red }");
    response
      .headers
      .push(("content-type".to_string(), "text/css".to_string()));

    assert!(storage
      .put("v1", &get("/static/styles.css"), &response)
      .unwrap());

    let cached = storage
      .match_request("v1", &get("/static/styles.css"))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response, response);
    assert!(storage.has("v1").unwrap());
    assert!(storage
      .match_request("v1", &get("/static/app.js"))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_put_replaces_prior_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("v1").unwrap();
    storage
      .put("v1", &get("/"), &HttpResponse::new(200, "old"))
      .unwrap();
    storage
      .put("v1", &get("/"), &HttpResponse::new(200, "new"))
      .unwrap();

    let cached = storage.match_request("v1", &get("/")).unwrap().unwrap();
    assert_eq!(cached.response.body, b"new");
    assert_eq!(storage.entry_count("v1").unwrap(), 1);
  }

  #[test]
  fn test_stores_are_isolated() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("v1").unwrap();
    storage
      .put("v1", &get("/"), &HttpResponse::new(200, "v1"))
      .unwrap();

    assert!(storage.match_request("v2", &get("/")).unwrap().is_none());
    assert!(!storage.has("v2").unwrap());
  }

  #[test]
  fn test_delete_removes_store_and_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("v1").unwrap();
    storage
      .put("v1", &get("/"), &HttpResponse::new(200, "shell"))
      .unwrap();
    storage.open("v2").unwrap();

    assert!(storage.delete("v1").unwrap());
    assert!(!storage.delete("v1").unwrap());
    assert_eq!(storage.keys().unwrap(), vec!["v2"]);
    assert_eq!(storage.entry_count("v1").unwrap(), 0);
    assert!(storage.match_request("v1", &get("/")).unwrap().is_none());
  }

  #[test]
  fn test_put_into_missing_store_is_skipped() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("v1").unwrap();
    storage.delete("v1").unwrap();

    let stored = storage
      .put("v1", &get("/"), &HttpResponse::new(200, "late"))
      .unwrap();
    assert!(!stored);
    assert!(storage.keys().unwrap().is_empty());
    assert!(storage.match_request("v1", &get("/")).unwrap().is_none());
  }

  #[test]
  fn test_put_all_stores_every_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let entries = vec![
      (get("/"), HttpResponse::new(200, "<html>")),
      (get("/static/styles.css"), HttpResponse::new(200, "css")),
    ];

    storage.put_all("v1", &entries).unwrap();

    assert_eq!(storage.keys().unwrap(), vec!["v1"]);
    assert_eq!(storage.entry_count("v1").unwrap(), 2);
  }

  #[test]
  fn test_fingerprint_round_trip() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("v1").unwrap();
    assert_eq!(storage.fingerprint("v1").unwrap(), None);

    storage.set_fingerprint("v1", "abc").unwrap();
    assert_eq!(storage.fingerprint("v1").unwrap().as_deref(), Some("abc"));
    assert_eq!(storage.fingerprint("missing").unwrap(), None);
  }

  #[test]
  fn test_registration_defaults_and_persists() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.load_registration().unwrap(), Registration::default());

    let registration = Registration {
      state: LifecycleState::Updating,
      active: Some("v1".to_string()),
      waiting: Some("v2".to_string()),
    };
    storage.save_registration(&registration).unwrap();
    assert_eq!(storage.load_registration().unwrap(), registration);
  }
}
