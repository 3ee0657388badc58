//! Durable API key storage.

use crate::error::KeyStoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// An issued API key and its quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    /// Requests allowed per key window.
    pub req_limit: u64,
    /// Characters allowed per key window. `None` means unlimited.
    pub char_limit: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl ApiKey {
    /// A fresh random key.
    pub fn generate(req_limit: u64, char_limit: Option<u64>, expires_in: Option<Duration>) -> Self {
        let created_at = Utc::now();
        Self {
            key: Uuid::new_v4().to_string(),
            req_limit,
            char_limit,
            created_at,
            expires_at: expires_in
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| created_at + d),
            revoked: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Key -> quota mapping consulted by the authenticator.
pub trait KeyStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<ApiKey>, KeyStoreError>;
    fn insert(&self, key: &ApiKey) -> Result<(), KeyStoreError>;
    /// Mark a key revoked. Returns false when the key does not exist.
    fn revoke(&self, key: &str) -> Result<bool, KeyStoreError>;
    fn list(&self) -> Result<Vec<ApiKey>, KeyStoreError>;
}

/// Key store backed by SQLite.
pub struct SqliteKeyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKeyStore {
    /// Open (or create) the key database at `path`.
    pub fn open(path: &Path) -> Result<Self, KeyStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    pub fn in_memory() -> Result<Self, KeyStoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_keys (
                api_key TEXT PRIMARY KEY,
                req_limit INTEGER NOT NULL,
                char_limit INTEGER,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                revoked INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, KeyStoreError> {
        self.conn.lock().map_err(|_| KeyStoreError::Poisoned)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
        let req_limit: i64 = row.get(1)?;
        let char_limit: Option<i64> = row.get(2)?;
        let created_at: String = row.get(3)?;
        let expires_at: Option<String> = row.get(4)?;
        Ok(ApiKey {
            key: row.get(0)?,
            req_limit: u64::try_from(req_limit).unwrap_or(0),
            char_limit: char_limit.map(|c| u64::try_from(c).unwrap_or(0)),
            created_at: parse_time(&created_at).unwrap_or_default(),
            expires_at: expires_at.as_deref().and_then(parse_time),
            revoked: row.get(5)?,
        })
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl KeyStore for SqliteKeyStore {
    fn get(&self, key: &str) -> Result<Option<ApiKey>, KeyStoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT api_key, req_limit, char_limit, created_at, expires_at, revoked
                 FROM api_keys WHERE api_key = ?",
                params![key],
                Self::from_row,
            )
            .optional()?)
    }

    fn insert(&self, key: &ApiKey) -> Result<(), KeyStoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO api_keys
                (api_key, req_limit, char_limit, created_at, expires_at, revoked)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                key.key,
                to_sql_int(key.req_limit),
                key.char_limit.map(to_sql_int),
                key.created_at.to_rfc3339(),
                key.expires_at.map(|t| t.to_rfc3339()),
                key.revoked,
            ],
        )?;
        Ok(())
    }

    fn revoke(&self, key: &str) -> Result<bool, KeyStoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE api_keys SET revoked = 1 WHERE api_key = ?",
            params![key],
        )?;
        Ok(changed > 0)
    }

    fn list(&self) -> Result<Vec<ApiKey>, KeyStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT api_key, req_limit, char_limit, created_at, expires_at, revoked
             FROM api_keys ORDER BY created_at, api_key",
        )?;
        let keys = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_reads_back_keys() {
        let store = SqliteKeyStore::in_memory().unwrap();
        let key = ApiKey::generate(80, Some(5000), None);

        store.insert(&key).unwrap();
        let loaded = store.get(&key.key).unwrap().unwrap();

        assert_eq!(loaded.key, key.key);
        assert_eq!(loaded.req_limit, 80);
        assert_eq!(loaded.char_limit, Some(5000));
        assert!(!loaded.revoked);
    }

    #[test]
    fn unknown_key_is_none() {
        let store = SqliteKeyStore::in_memory().unwrap();
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn revoke_marks_key() {
        let store = SqliteKeyStore::in_memory().unwrap();
        let key = ApiKey::generate(10, None, None);
        store.insert(&key).unwrap();

        assert!(store.revoke(&key.key).unwrap());
        assert!(!store.revoke("missing").unwrap());
        assert!(store.get(&key.key).unwrap().unwrap().revoked);
    }

    #[test]
    fn keys_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("keys.sqlite");
        let key = ApiKey::generate(10, None, Some(Duration::from_secs(3600)));

        SqliteKeyStore::open(&path).unwrap().insert(&key).unwrap();
        let reopened = SqliteKeyStore::open(&path).unwrap();

        let keys = reopened.list().unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].expires_at.is_some());
    }

    #[test]
    fn unusable_parent_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let result = SqliteKeyStore::open(&blocker.join("keys.sqlite"));

        assert!(matches!(result, Err(KeyStoreError::Io(_))));
    }

    #[test]
    fn expiry_is_inclusive() {
        let mut key = ApiKey::generate(10, None, None);
        assert!(!key.is_expired(Utc::now()));
        let now = Utc::now();
        key.expires_at = Some(now);
        assert!(key.is_expired(now));
    }
}
