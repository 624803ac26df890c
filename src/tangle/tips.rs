// Tip registry - transactions nobody approves yet
//
// A cache of committed state: it can always be rebuilt from the stored
// approvee edges, so it is not written to disk. Only the ledger mutates it.

use crate::convert::Hash;
use std::collections::HashSet;
use std::sync::RwLock;

/// Concurrent set of tip hashes
#[derive(Debug, Default)]
pub struct TipSet {
    tips: RwLock<HashSet<Hash>>,
}

impl TipSet {
    /// Create an empty tip set (genesis)
    pub fn new() -> Self {
        Self::default()
    }

    /// Current tips, in no particular order
    ///
    /// Returns a copy, so callers may iterate it as often as they like while
    /// the ledger keeps changing.
    pub fn tips(&self) -> Vec<Hash> {
        self.read().iter().copied().collect()
    }

    /// Check if a hash is a tip
    pub fn contains(&self, hash: &Hash) -> bool {
        self.read().contains(hash)
    }

    /// Number of tips
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if there are no tips
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub(crate) fn insert(&self, hash: Hash) -> bool {
        self.write().insert(hash)
    }

    pub(crate) fn remove(&self, hash: &Hash) -> bool {
        self.write().remove(hash)
    }

    /// Insert `hash` when `check` holds, with the registry locked throughout
    pub(crate) fn insert_if<E>(
        &self,
        hash: Hash,
        check: impl FnOnce() -> Result<bool, E>,
    ) -> Result<bool, E> {
        let mut tips = self.write();
        if check()? {
            return Ok(tips.insert(hash));
        }
        Ok(false)
    }

    pub(crate) fn replace(&self, tips: HashSet<Hash>) {
        *self.write() = tips;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashSet<Hash>> {
        self.tips.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<Hash>> {
        self.tips.write().unwrap_or_else(|e| e.into_inner())
    }
}
