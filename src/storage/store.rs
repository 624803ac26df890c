// TangleDb - Persistent key-value storage using sled
//
// Provides the transactional store contract the ledger is built on:
// - Point reads and prefix scans over committed state
// - Atomic write transactions with a bounded size
// - A bulk writer that splits long loads into committed batches

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors from storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    OpenFailed(String),

    #[error("Database operation failed: {0}")]
    DatabaseError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Flush failed: {0}")]
    FlushFailed(String),

    #[error("Transaction too large: {size} bytes exceeds limit of {limit}")]
    TxnTooLarge { size: usize, limit: usize },
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

/// Statistics about the storage
#[derive(Clone, Debug)]
pub struct StorageStats {
    /// Number of keys in the database
    pub key_count: usize,
    /// Approximate disk size in bytes
    pub disk_size_bytes: u64,
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum bytes (keys plus values) staged in one write transaction
    pub max_txn_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_txn_bytes: 10 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_txn_bytes(mut self, bytes: usize) -> Self {
        self.max_txn_bytes = bytes;
        self
    }
}

/// Encode a stored value
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    postcard::to_allocvec(value).map_err(|e| StoreError::SerializationFailed(e.to_string()))
}

/// Decode a stored value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    postcard::from_bytes(bytes).map_err(|e| StoreError::DeserializationFailed(e.to_string()))
}

/// A single staged write
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl WriteOp {
    /// Encode `value` and stage it under `key`
    pub fn put<T: Serialize>(key: Vec<u8>, value: &T) -> Result<Self, StoreError> {
        Ok(WriteOp::Put(key, encode(value)?))
    }

    fn size(&self) -> usize {
        match self {
            WriteOp::Put(k, v) => k.len() + v.len(),
            WriteOp::Delete(k) => k.len(),
        }
    }
}

/// Persistent key-value store for the tangle
///
/// Uses sled for crash-safe, embedded storage. Committed writes are visible to
/// every reader; a write transaction is applied as a single atomic batch.
pub struct TangleDb {
    db: sled::Db,
    config: StoreConfig,
}

impl TangleDb {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db, config })
    }

    /// Open a throwaway store that is removed on drop
    pub fn temporary(config: StoreConfig) -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db, config })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::FlushFailed(e.to_string()))?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            key_count: self.db.len(),
            disk_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Get raw bytes
    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    /// Get and decode a value
    pub fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Check whether a key is present
    pub fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.db.contains_key(key)?)
    }

    /// Check whether any key starts with `prefix`
    pub fn has_prefix(&self, prefix: &[u8]) -> Result<bool, StoreError> {
        Ok(self.db.scan_prefix(prefix).next().transpose()?.is_some())
    }

    /// Iterate all entries with a given prefix, in key order
    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>> + 'a {
        self.db.scan_prefix(prefix).map(|entry| {
            let (k, v) = entry?;
            Ok((k.to_vec(), v.to_vec()))
        })
    }

    /// List all keys with a given prefix
    pub fn list_keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut keys = Vec::new();
        for result in self.db.scan_prefix(prefix) {
            let (key, _) = result?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    /// Every entry in key order
    pub fn dump(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut entries = Vec::with_capacity(self.db.len());
        for result in self.db.iter() {
            let (k, v) = result?;
            entries.push((k.to_vec(), v.to_vec()));
        }
        Ok(entries)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Begin an atomic write transaction
    pub fn transaction(&self) -> WriteTxn<'_> {
        WriteTxn {
            db: self,
            batch: sled::Batch::default(),
            size: 0,
            ops: 0,
        }
    }

    /// Begin a bulk write split into size-bounded committed batches
    pub fn batch_writer(&self) -> BatchWriter<'_> {
        BatchWriter {
            db: self,
            txn: self.transaction(),
            commits: 0,
            records: 0,
        }
    }

    /// Apply a set of writes as one transaction
    pub fn write(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut txn = self.transaction();
        txn.put_all(ops)?;
        txn.commit()
    }
}

/// An atomic write transaction
///
/// Writes are staged in memory and become visible together on
/// [`WriteTxn::commit`]. Dropping the transaction discards them.
pub struct WriteTxn<'a> {
    db: &'a TangleDb,
    batch: sled::Batch,
    size: usize,
    ops: usize,
}

impl<'a> WriteTxn<'a> {
    /// Bytes staged so far
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if nothing is staged
    pub fn is_empty(&self) -> bool {
        self.ops == 0
    }

    fn reserve(&mut self, size: usize) -> Result<(), StoreError> {
        let limit = self.db.config.max_txn_bytes;
        if self.size + size > limit {
            return Err(StoreError::TxnTooLarge {
                size: self.size + size,
                limit,
            });
        }
        self.size += size;
        self.ops += 1;
        Ok(())
    }

    /// Stage raw bytes under a key
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.reserve(key.len() + value.len())?;
        self.batch.insert(key, value);
        Ok(())
    }

    /// Encode and stage a value under a key
    pub fn put_value<T: Serialize>(&mut self, key: &[u8], value: &T) -> Result<(), StoreError> {
        let bytes = encode(value)?;
        self.put(key, &bytes)
    }

    /// Stage a key removal
    pub fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.reserve(key.len())?;
        self.batch.remove(key);
        Ok(())
    }

    /// Stage a group of writes, all or none of them
    pub fn put_all(&mut self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let total: usize = ops.iter().map(WriteOp::size).sum();
        let limit = self.db.config.max_txn_bytes;
        if self.size + total > limit {
            return Err(StoreError::TxnTooLarge {
                size: self.size + total,
                limit,
            });
        }
        for op in ops {
            match op {
                WriteOp::Put(k, v) => self.put(k, v)?,
                WriteOp::Delete(k) => self.delete(k)?,
            }
        }
        Ok(())
    }

    /// Atomically apply every staged write
    pub fn commit(self) -> Result<(), StoreError> {
        if self.ops == 0 {
            return Ok(());
        }
        self.db.db.apply_batch(self.batch)?;
        Ok(())
    }
}

/// Summary of a finished bulk write
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Number of record groups written
    pub records: usize,
    /// Number of committed sub-transactions
    pub commits: usize,
}

/// Bulk writer over size-bounded transactions
///
/// Each record group is atomic. When a group does not fit in the open
/// transaction, that transaction is committed and the group retried in a
/// fresh one. A crash between two commits leaves the earlier batches applied.
pub struct BatchWriter<'a> {
    db: &'a TangleDb,
    txn: WriteTxn<'a>,
    commits: usize,
    records: usize,
}

impl<'a> BatchWriter<'a> {
    /// Stage one record group
    pub fn write(&mut self, ops: &[WriteOp]) -> Result<(), StoreError> {
        match self.txn.put_all(ops) {
            Ok(()) => {}
            Err(StoreError::TxnTooLarge { .. }) if !self.txn.is_empty() => {
                let full = std::mem::replace(&mut self.txn, self.db.transaction());
                full.commit()?;
                self.commits += 1;
                self.txn.put_all(ops)?;
            }
            Err(e) => return Err(e),
        }
        self.records += 1;
        Ok(())
    }

    /// Commit whatever is still staged
    pub fn finish(self) -> Result<BatchStats, StoreError> {
        let mut commits = self.commits;
        if !self.txn.is_empty() {
            self.txn.commit()?;
            commits += 1;
        }
        Ok(BatchStats {
            records: self.records,
            commits,
        })
    }
}
