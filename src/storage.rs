//! Persistent key-value storage behind the consensus engine.
//!
//! Provides a `Database` trait, a sled-backed implementation for
//! production, and an in-memory implementation for tests. The vertex
//! store and the bootstrap job queue both write through this trait
//! using the fixed key prefixes they own.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("corrupt record under key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Trait for persistent key-value backends.
///
/// Implementations must be internally thread-safe: the consensus
/// executor is the only writer, but reads may come from other tasks.
pub trait Database: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;
    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }
    fn flush(&self) -> Result<(), StorageError>;
}

/// Sled-backed database.
pub struct SledDb {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledDb {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary database (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let tree = db
            .open_tree("consensus")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(SledDb { db, tree })
    }
}

impl Database for SledDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.tree
            .get(key)
            .map(|opt| opt.map(|v| v.to_vec()))
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.tree
            .insert(key, value)
            .map(|_| ())
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.tree
            .remove(key)
            .map(|_| ())
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        self.tree
            .contains_key(key)
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| StorageError::Io(e.to_string()))
    }
}

/// In-memory database used by the test suites.
#[derive(Default)]
pub struct MemDb {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemDb {
    pub fn new() -> Self {
        MemDb::default()
    }
}

impl Database for MemDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.map.lock().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
