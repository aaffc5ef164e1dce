//! Storage backend implementations.
//!
//! This module provides the key-value stores ledger snapshots are written to:
//! - InMemoryStore: Fast, ephemeral storage for tests and dry runs
//! - FileStore: Human-readable JSON file, hex-encoded keys and values
//! - BinaryStore: Compact bincode file
//!
//! Both file stores keep everything in a cache and only touch disk on
//! `flush`, which replaces the data file through a temporary file and a
//! rename so a crash mid-write never leaves a half-written snapshot.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::error::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// STORAGE TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Key type for storage operations
pub type StorageKey = Vec<u8>;

/// Value type for storage operations
pub type StorageValue = Vec<u8>;

/// Trait for storage backends
pub trait StorageBackend: Send + Sync {
    /// Get a value by key
    fn get(&self, key: &[u8]) -> Result<Option<StorageValue>>;

    /// Set a value for a key
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Set several values under one lock acquisition
    fn set_batch(&self, entries: &[(StorageKey, StorageValue)]) -> Result<()>;

    /// Delete a key
    fn delete(&self, key: &[u8]) -> Result<bool>;

    /// Check if a key exists
    fn exists(&self, key: &[u8]) -> Result<bool>;

    /// List all keys with a given prefix
    fn list_prefix(&self, prefix: &[u8]) -> Result<Vec<StorageKey>>;

    /// Flush any pending writes to persistent storage
    fn flush(&self) -> Result<()>;

    /// Get all keys
    fn keys(&self) -> Result<Vec<StorageKey>>;

    /// Clear all data
    fn clear(&self) -> Result<()>;
}

type Table = HashMap<StorageKey, StorageValue>;

fn lock_poisoned<T>(_: T) -> Error {
    Error::Lock
}

fn storage_err(context: &str, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Storage(format!("{} {}: {}", context, path.display(), e))
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory storage backend (for testing and ephemeral use)
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: RwLock<Table>,
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.data.read().map_or(0, |data| data.len())
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for InMemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<StorageValue>> {
        let data = self.data.read().map_err(lock_poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut data = self.data.write().map_err(lock_poisoned)?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn set_batch(&self, entries: &[(StorageKey, StorageValue)]) -> Result<()> {
        let mut data = self.data.write().map_err(lock_poisoned)?;
        data.extend(entries.iter().cloned());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut data = self.data.write().map_err(lock_poisoned)?;
        Ok(data.remove(key).is_some())
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        let data = self.data.read().map_err(lock_poisoned)?;
        Ok(data.contains_key(key))
    }

    fn list_prefix(&self, prefix: &[u8]) -> Result<Vec<StorageKey>> {
        let data = self.data.read().map_err(lock_poisoned)?;
        let mut keys: Vec<_> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<StorageKey>> {
        let data = self.data.read().map_err(lock_poisoned)?;
        Ok(data.keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        let mut data = self.data.write().map_err(lock_poisoned)?;
        data.clear();
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT FORMATS
// ═══════════════════════════════════════════════════════════════════════════════

/// On-disk encoding of a whole key-value table
pub trait SnapshotFormat: Send + Sync {
    /// Data file name inside the store directory
    const FILE_NAME: &'static str;

    /// Encode the table
    fn encode(table: &Table) -> Result<Vec<u8>>;

    /// Decode the table
    fn decode(bytes: &[u8]) -> Result<Table>;
}

/// Pretty-printed JSON with hex-encoded keys and values
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl SnapshotFormat for JsonFormat {
    const FILE_NAME: &'static str = "data.json";

    fn encode(table: &Table) -> Result<Vec<u8>> {
        // Sorted so the file diffs cleanly between flushes
        let hexed: BTreeMap<String, String> = table
            .iter()
            .map(|(k, v)| (hex::encode(k), hex::encode(v)))
            .collect();
        serde_json::to_vec_pretty(&hexed).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Table> {
        let hexed: HashMap<String, String> = serde_json::from_slice(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        hexed
            .into_iter()
            .map(|(k, v)| {
                let key = hex::decode(&k)
                    .map_err(|e| Error::Deserialization(format!("key '{}': {}", k, e)))?;
                let value = hex::decode(&v)
                    .map_err(|e| Error::Deserialization(format!("value for '{}': {}", k, e)))?;
                Ok((key, value))
            })
            .collect()
    }
}

/// Compact bincode encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeFormat;

impl SnapshotFormat for BincodeFormat {
    const FILE_NAME: &'static str = "data.bin";

    fn encode(table: &Table) -> Result<Vec<u8>> {
        bincode::serialize(table).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Table> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FILE-BACKED STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// File-backed storage with an in-memory cache
#[derive(Debug)]
pub struct SnapshotStore<F: SnapshotFormat> {
    /// Base directory for storage
    base_path: PathBuf,
    /// In-memory cache
    cache: RwLock<Table>,
    /// Whether the cache differs from disk
    dirty: AtomicBool,
    _format: PhantomData<F>,
}

/// JSON file store
pub type FileStore = SnapshotStore<JsonFormat>;

/// Bincode file store
pub type BinaryStore = SnapshotStore<BincodeFormat>;

impl<F: SnapshotFormat> SnapshotStore<F> {
    /// Open (or create) a store in the given directory
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)
            .map_err(|e| storage_err("failed to create storage directory", &base_path, e))?;

        let store = Self {
            base_path,
            cache: RwLock::new(Table::new()),
            dirty: AtomicBool::new(false),
            _format: PhantomData,
        };
        store.load_from_disk()?;
        Ok(store)
    }

    /// Path of the data file
    pub fn data_file_path(&self) -> PathBuf {
        self.base_path.join(F::FILE_NAME)
    }

    fn load_from_disk(&self) -> Result<()> {
        let path = self.data_file_path();
        if !path.exists() {
            return Ok(());
        }

        let bytes = fs::read(&path).map_err(|e| storage_err("failed to read", &path, e))?;
        let loaded = F::decode(&bytes)?;
        tracing::debug!(path = %path.display(), entries = loaded.len(), "store loaded");

        let mut cache = self.cache.write().map_err(lock_poisoned)?;
        *cache = loaded;
        Ok(())
    }

    fn save_to_disk(&self) -> Result<()> {
        let bytes = {
            let cache = self.cache.read().map_err(lock_poisoned)?;
            F::encode(&cache)?
        };

        let path = self.data_file_path();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).map_err(|e| storage_err("failed to write", &tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| storage_err("failed to replace", &path, e))?;

        self.dirty.store(false, Ordering::SeqCst);
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "store flushed");
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}

impl<F: SnapshotFormat> StorageBackend for SnapshotStore<F> {
    fn get(&self, key: &[u8]) -> Result<Option<StorageValue>> {
        let cache = self.cache.read().map_err(lock_poisoned)?;
        Ok(cache.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut cache = self.cache.write().map_err(lock_poisoned)?;
        cache.insert(key.to_vec(), value.to_vec());
        self.mark_dirty();
        Ok(())
    }

    fn set_batch(&self, entries: &[(StorageKey, StorageValue)]) -> Result<()> {
        let mut cache = self.cache.write().map_err(lock_poisoned)?;
        cache.extend(entries.iter().cloned());
        self.mark_dirty();
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut cache = self.cache.write().map_err(lock_poisoned)?;
        let existed = cache.remove(key).is_some();
        if existed {
            self.mark_dirty();
        }
        Ok(existed)
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        let cache = self.cache.read().map_err(lock_poisoned)?;
        Ok(cache.contains_key(key))
    }

    fn list_prefix(&self, prefix: &[u8]) -> Result<Vec<StorageKey>> {
        let cache = self.cache.read().map_err(lock_poisoned)?;
        let mut keys: Vec<_> = cache
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn flush(&self) -> Result<()> {
        if self.dirty.load(Ordering::SeqCst) {
            self.save_to_disk()?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<StorageKey>> {
        let cache = self.cache.read().map_err(lock_poisoned)?;
        Ok(cache.keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        let mut cache = self.cache.write().map_err(lock_poisoned)?;
        cache.clear();
        self.mark_dirty();
        Ok(())
    }
}

impl<F: SnapshotFormat> Drop for SnapshotStore<F> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(path = %self.data_file_path().display(), error = %e, "flush on drop failed");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TYPED STORE WRAPPER
// ═══════════════════════════════════════════════════════════════════════════════

/// Type-safe wrapper around a storage backend
pub struct TypedStore<B: StorageBackend> {
    backend: B,
}

impl<B: StorageBackend> TypedStore<B> {
    /// Create a new typed store
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Get a typed value
    pub fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        self.backend
            .get(key)?
            .map(|data| {
                bincode::deserialize(&data).map_err(|e| {
                    Error::Deserialization(format!(
                        "value under '{}': {}",
                        String::from_utf8_lossy(key),
                        e
                    ))
                })
            })
            .transpose()
    }

    /// Set a typed value
    pub fn set<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        self.backend.set(key, &encode(value)?)
    }

    /// Set several pre-encoded values at once
    pub fn set_batch(&self, entries: &[(StorageKey, StorageValue)]) -> Result<()> {
        self.backend.set_batch(entries)
    }

    /// Delete a value
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.backend.delete(key)
    }

    /// Check if a key exists
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.backend.exists(key)
    }

    /// List keys with prefix
    pub fn list_prefix(&self, prefix: &[u8]) -> Result<Vec<StorageKey>> {
        self.backend.list_prefix(prefix)
    }

    /// Flush pending writes
    pub fn flush(&self) -> Result<()> {
        self.backend.flush()
    }

    /// Clear all data
    pub fn clear(&self) -> Result<()> {
        self.backend.clear()
    }

    /// Get the underlying backend
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

/// Encode a value the way [`TypedStore`] stores it
pub fn encode<T: Serialize>(value: &T) -> Result<StorageValue> {
    bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// KEY PREFIXES
// ═══════════════════════════════════════════════════════════════════════════════

/// Key prefixes for different data types
pub mod prefixes {
    /// Stability pool prefix
    pub const POOL: &[u8] = b"sp:";
    /// Position book prefix
    pub const POSITIONS: &[u8] = b"pos:";
    /// Liquidation engine prefix
    pub const ENGINE: &[u8] = b"liq:";
    /// Protocol parameters prefix
    pub const PARAMS: &[u8] = b"cfg:";
    /// Event log prefix
    pub const EVENTS: &[u8] = b"evt:";
    /// Snapshot metadata prefix
    pub const META: &[u8] = b"meta:";
}

/// Create a key with a prefix
pub fn make_key(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(prefix.len() + key.len());
    result.extend_from_slice(prefix);
    result.extend_from_slice(key);
    result
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
