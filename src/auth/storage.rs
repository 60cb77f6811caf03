// Secret storage backends
// Key-value stores the credential store persists tokens into

use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::StorageUnavailable;

/// Durable key-value store for secrets
///
/// Each operation is atomic for its key. Deleting a missing key succeeds.
pub trait SecretStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageUnavailable>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageUnavailable>;

    fn delete_item(&self, key: &str) -> Result<(), StorageUnavailable>;
}

/// OS keychain storage, one entry per key under a shared service name
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, StorageUnavailable> {
        keyring::Entry::new(&self.service, key).map_err(StorageUnavailable::from)
    }
}

impl SecretStorage for KeyringStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageUnavailable> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageUnavailable> {
        self.entry(key)?.set_password(value)?;
        Ok(())
    }

    fn delete_item(&self, key: &str) -> Result<(), StorageUnavailable> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// SQLite-backed storage using a single `auth_kv` table
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStorage {
    /// Open (or create) the database and ensure the table exists
    pub fn open(path: &Path) -> Result<Self, StorageUnavailable> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageUnavailable::new(format!(
                        "failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )?;

        tracing::debug!("Opened SQLite secret storage: {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StorageUnavailable> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageUnavailable::new("sqlite connection lock poisoned"))?;
        f(&conn).map_err(StorageUnavailable::from)
    }
}

impl SecretStorage for SqliteStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageUnavailable> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageUnavailable> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
        })?;
        Ok(())
    }

    fn delete_item(&self, key: &str) -> Result<(), StorageUnavailable> {
        self.with_conn(|conn| conn.execute("DELETE FROM auth_kv WHERE key = ?", [key]))?;
        Ok(())
    }
}

/// In-memory storage for tests and throwaway sessions
///
/// `set_unavailable(true)` makes every operation fail, standing in for a
/// locked or missing platform keychain.
#[derive(Default)]
pub struct MemoryStorage {
    items: DashMap<String, String>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn check(&self) -> Result<(), StorageUnavailable> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageUnavailable::new("memory storage marked unavailable"));
        }
        Ok(())
    }
}

impl SecretStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageUnavailable> {
        self.check()?;
        Ok(self.items.get(key).map(|entry| entry.value().clone()))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageUnavailable> {
        self.check()?;
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_item(&self, key: &str) -> Result<(), StorageUnavailable> {
        self.check()?;
        self.items.remove(key);
        Ok(())
    }
}
