// LedgerStore - atomic multi-index persistence of transactions
//
// Every saved transaction fans out into a set of denormalized records:
// - per-hash records (raw bytes, timestamp, value, address, bundle, tag)
// - bundle, tag and address membership indices
// - a relation record and two approvee edges for graph traversal
//
// All of them are staged in one write transaction and committed together.
// The tip registry is updated only after the commit succeeds.

use crate::convert::Hash;
use crate::storage::keys::{self, kind};
use crate::storage::{StoreError, TangleDb, WriteOp};
use crate::tangle::tips::TipSet;
use crate::tangle::transaction::{Transaction, TRANSACTION_BYTES};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info};

/// Errors from ledger operations
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid transaction bytes: expected at least {expected}, got {actual}")]
    InvalidRawLength { expected: usize, actual: usize },

    #[error("Failed saving transaction {hash}: {source}")]
    SaveFailed {
        hash: String,
        #[source]
        source: StoreError,
    },

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Durable tangle storage plus the in-memory tip registry
pub struct LedgerStore {
    db: TangleDb,
    tips: TipSet,
    /// Serializes ledger writers; snapshots hold it for their whole run
    write_gate: Mutex<()>,
}

impl LedgerStore {
    /// Wrap a store and rebuild the tip registry from its approvee edges
    pub fn open(db: TangleDb) -> Result<Self, LedgerError> {
        let ledger = Self {
            db,
            tips: TipSet::new(),
            write_gate: Mutex::new(()),
        };
        ledger.rebuild_tips()?;
        info!(tips = ledger.tips.len(), "Ledger opened");
        Ok(ledger)
    }

    /// The underlying store
    pub fn db(&self) -> &TangleDb {
        &self.db
    }

    /// The tip registry
    pub fn tip_set(&self) -> &TipSet {
        &self.tips
    }

    /// Current tips
    pub fn tips(&self) -> Vec<Hash> {
        self.tips.tips()
    }

    /// Enter the writer section, excluding every other ledger writer
    pub fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rebuild_tips(&self) -> Result<(), LedgerError> {
        let mut tips = HashSet::new();
        for entry in self.db.scan_prefix(&keys::prefix(kind::HASH)) {
            let (key, _) = entry?;
            let hash = keys::id_of(&key)
                .ok_or_else(|| LedgerError::CorruptRecord("hash key".to_string()))?;
            if !self.db.has_prefix(&keys::key(&hash, kind::APPROVEE))? {
                tips.insert(hash);
            }
        }
        self.tips.replace(tips);
        Ok(())
    }

    // ========================================================================
    // SAVE
    // ========================================================================

    /// Persist a transaction and all its indices atomically
    ///
    /// `raw` must hold at least the 1604 byte wire encoding; only that prefix
    /// is stored. Saving an already stored hash does nothing.
    pub fn save(&self, tx: &Transaction, raw: &[u8]) -> Result<(), LedgerError> {
        if raw.len() < TRANSACTION_BYTES {
            return Err(LedgerError::InvalidRawLength {
                expected: TRANSACTION_BYTES,
                actual: raw.len(),
            });
        }

        let _gate = self.lock_writes();

        if self.db.contains(&keys::key(&tx.hash, kind::HASH))? {
            debug!(hash = ?tx.hash, "Transaction already stored");
            return Ok(());
        }

        let ops = Self::index_writes(tx, &raw[..TRANSACTION_BYTES])
            .map_err(|e| Self::save_failed(tx, e))?;

        let mut txn = self.db.transaction();
        for op in &ops {
            txn.put_all(std::slice::from_ref(op))
                .map_err(|e| Self::save_failed(tx, e))?;
        }

        let approved = self
            .db
            .has_prefix(&keys::key(&tx.hash, kind::APPROVEE))
            .map_err(|e| Self::save_failed(tx, e))?;

        txn.commit().map_err(|e| Self::save_failed(tx, e))?;

        self.tips.remove(&tx.trunk);
        self.tips.remove(&tx.branch);
        if !approved {
            self.tips.insert(tx.hash);
        }
        Ok(())
    }

    fn save_failed(tx: &Transaction, source: StoreError) -> LedgerError {
        let hash = tx.hash.to_trytes();
        error!(hash = %hash, error = %source, "Failed saving transaction");
        LedgerError::SaveFailed { hash, source }
    }

    fn index_writes(tx: &Transaction, raw: &[u8]) -> Result<Vec<WriteOp>, StoreError> {
        let key = keys::key(&tx.hash, kind::HASH);
        let trunk_key = keys::key(&tx.trunk, kind::HASH);
        let branch_key = keys::key(&tx.branch, kind::HASH);

        Ok(vec![
            WriteOp::Put(key.clone(), tx.hash.as_bytes().to_vec()),
            WriteOp::put(keys::key(&tx.hash, kind::TIMESTAMP), &tx.timestamp)?,
            WriteOp::Put(keys::key(&tx.hash, kind::BYTES), raw.to_vec()),
            WriteOp::put(keys::key(&tx.hash, kind::VALUE), &tx.value)?,
            WriteOp::Put(
                keys::key(&tx.hash, kind::ADDRESS_HASH),
                tx.address.as_bytes().to_vec(),
            ),
            WriteOp::Put(
                keys::key(&tx.hash, kind::BUNDLE_HASH),
                tx.bundle.as_bytes().to_vec(),
            ),
            WriteOp::Put(keys::key(&tx.hash, kind::TAG_HASH), tx.tag.as_bytes().to_vec()),
            WriteOp::put(
                keys::composite(&keys::key(&tx.bundle, kind::BUNDLE), &key),
                &tx.current_index,
            )?,
            WriteOp::Put(keys::composite(&keys::key(&tx.tag, kind::TAG), &key), Vec::new()),
            WriteOp::put(
                keys::composite(&keys::key(&tx.address, kind::ADDRESS), &key),
                &tx.value,
            )?,
            WriteOp::Put(
                keys::key(&tx.hash, kind::RELATION),
                keys::composite(&trunk_key, &branch_key),
            ),
            WriteOp::put(
                keys::composite(&keys::key(&tx.trunk, kind::APPROVEE), &key),
                &true,
            )?,
            WriteOp::put(
                keys::composite(&keys::key(&tx.branch, kind::APPROVEE), &key),
                &false,
            )?,
        ])
    }

    // ========================================================================
    // FLAGS AND BALANCES
    // ========================================================================

    /// Check the CONFIRMED flag of a transaction
    pub fn is_confirmed(&self, hash: &Hash) -> Result<bool, LedgerError> {
        Ok(self.db.contains(&keys::key(hash, kind::CONFIRMED))?)
    }

    /// Check the SPENT flag of an address
    pub fn is_spent(&self, address: &Hash) -> Result<bool, LedgerError> {
        Ok(self.db.contains(&keys::key(address, kind::SPENT))?)
    }

    /// Running balance of an address
    pub fn balance(&self, address: &Hash) -> Result<Option<i64>, LedgerError> {
        Ok(self.db.get(&keys::key(address, kind::BALANCE))?)
    }

    /// Balance of an address as of the current snapshot
    pub fn snapshot_balance(&self, address: &Hash) -> Result<Option<i64>, LedgerError> {
        Ok(self.db.get(&keys::key(address, kind::SNAPSHOT_BALANCE))?)
    }

    /// Check if a bundle is retained verbatim by the snapshot
    pub fn is_pending_bundle(&self, bundle: &Hash) -> Result<bool, LedgerError> {
        Ok(self.db.contains(&keys::key(bundle, kind::PENDING_BUNDLE))?)
    }

    /// Flag a transaction as confirmed and apply its value to its address
    ///
    /// Returns false when the transaction is unknown or already confirmed.
    pub fn mark_confirmed(&self, hash: &Hash) -> Result<bool, LedgerError> {
        let _gate = self.lock_writes();

        if !self.contains(hash)? || self.is_confirmed(hash)? {
            return Ok(false);
        }
        let address = self.get_address(hash)?.ok_or_else(|| missing(hash, "address"))?;
        let value = self.get_value(hash)?.ok_or_else(|| missing(hash, "value"))?;

        let current = match self.balance(&address)? {
            Some(balance) => balance,
            None => self.snapshot_balance(&address)?.unwrap_or(0),
        };

        let updated = current.checked_add(value).ok_or_else(|| {
            LedgerError::CorruptRecord(format!("balance overflow for {}", address))
        })?;

        let mut ops = vec![
            WriteOp::put(keys::key(hash, kind::CONFIRMED), &true)?,
            WriteOp::put(keys::key(&address, kind::BALANCE), &updated)?,
        ];
        if value < 0 {
            ops.push(WriteOp::put(keys::key(&address, kind::SPENT), &true)?);
        }
        self.db.write(&ops)?;
        debug!(hash = ?hash, value, "Transaction confirmed");
        Ok(true)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Check if a transaction is stored
    pub fn contains(&self, hash: &Hash) -> Result<bool, LedgerError> {
        Ok(self.db.contains(&keys::key(hash, kind::HASH))?)
    }

    /// The stored wire encoding
    pub fn get_raw(&self, hash: &Hash) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self.db.get_raw(&keys::key(hash, kind::BYTES))?)
    }

    pub fn get_timestamp(&self, hash: &Hash) -> Result<Option<i64>, LedgerError> {
        Ok(self.db.get(&keys::key(hash, kind::TIMESTAMP))?)
    }

    pub fn get_value(&self, hash: &Hash) -> Result<Option<i64>, LedgerError> {
        Ok(self.db.get(&keys::key(hash, kind::VALUE))?)
    }

    pub fn get_address(&self, hash: &Hash) -> Result<Option<Hash>, LedgerError> {
        self.get_id(hash, kind::ADDRESS_HASH)
    }

    pub fn get_bundle(&self, hash: &Hash) -> Result<Option<Hash>, LedgerError> {
        self.get_id(hash, kind::BUNDLE_HASH)
    }

    pub fn get_tag(&self, hash: &Hash) -> Result<Option<Hash>, LedgerError> {
        self.get_id(hash, kind::TAG_HASH)
    }

    fn get_id(&self, hash: &Hash, record: u8) -> Result<Option<Hash>, LedgerError> {
        match self.db.get_raw(&keys::key(hash, record))? {
            Some(bytes) => Hash::from_slice(&bytes)
                .map(Some)
                .map_err(|e| LedgerError::CorruptRecord(e.to_string())),
            None => Ok(None),
        }
    }

    /// Trunk and branch of a transaction
    pub fn relation(&self, hash: &Hash) -> Result<Option<(Hash, Hash)>, LedgerError> {
        let Some(bytes) = self.db.get_raw(&keys::key(hash, kind::RELATION))? else {
            return Ok(None);
        };
        let trunk = keys::id_of(&bytes);
        let branch = keys::member_of(&bytes);
        match (trunk, branch) {
            (Some(trunk), Some(branch)) => Ok(Some((trunk, branch))),
            _ => Err(LedgerError::CorruptRecord(format!("relation of {:?}", hash))),
        }
    }

    /// Transactions that reference `hash` as trunk or branch
    pub fn approvers(&self, hash: &Hash) -> Result<Vec<Hash>, LedgerError> {
        self.members(&keys::key(hash, kind::APPROVEE))
    }

    /// Transactions of a bundle with their index in it
    pub fn bundle_members(&self, bundle: &Hash) -> Result<Vec<(Hash, u64)>, LedgerError> {
        self.members_with(&keys::key(bundle, kind::BUNDLE))
    }

    /// Transactions carrying a tag
    pub fn find_by_tag(&self, tag: &Hash) -> Result<Vec<Hash>, LedgerError> {
        self.members(&keys::key(tag, kind::TAG))
    }

    /// Transactions touching an address with their values
    pub fn find_by_address(&self, address: &Hash) -> Result<Vec<(Hash, i64)>, LedgerError> {
        self.members_with(&keys::key(address, kind::ADDRESS))
    }

    fn members(&self, prefix: &[u8]) -> Result<Vec<Hash>, LedgerError> {
        let mut found = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (key, _) = entry?;
            found.push(member(&key)?);
        }
        Ok(found)
    }

    fn members_with<T: serde::de::DeserializeOwned>(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<(Hash, T)>, LedgerError> {
        let mut found = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (key, value) = entry?;
            found.push((member(&key)?, crate::storage::decode(&value)?));
        }
        Ok(found)
    }

    /// Stored transactions issued strictly before `cutoff`
    pub fn transactions_before(&self, cutoff: i64) -> Result<Vec<Hash>, LedgerError> {
        let mut found = Vec::new();
        for entry in self.db.scan_prefix(&keys::prefix(kind::TIMESTAMP)) {
            let (key, value) = entry?;
            let timestamp: i64 = crate::storage::decode(&value)?;
            if timestamp < cutoff {
                found.push(
                    keys::id_of(&key)
                        .ok_or_else(|| LedgerError::CorruptRecord("timestamp key".to_string()))?,
                );
            }
        }
        Ok(found)
    }

    // ========================================================================
    // PRUNING
    // ========================================================================

    /// Remove the whole storage footprint of a transaction
    ///
    /// Edges pointing at the transaction from newer ones are kept, so those
    /// never turn back into tips. A stored trunk or branch left without any
    /// approver becomes a tip again. Returns false if nothing was stored.
    pub fn prune(&self, hash: &Hash) -> Result<bool, LedgerError> {
        let marker = keys::key(hash, kind::PRUNABLE);
        if !self.contains(hash)? {
            self.db.write(&[WriteOp::Delete(marker)])?;
            return Ok(false);
        }

        let key = keys::key(hash, kind::HASH);
        let mut ops: Vec<WriteOp> = [
            kind::HASH,
            kind::TIMESTAMP,
            kind::BYTES,
            kind::VALUE,
            kind::ADDRESS_HASH,
            kind::BUNDLE_HASH,
            kind::TAG_HASH,
            kind::RELATION,
            kind::CONFIRMED,
        ]
        .iter()
        .map(|&record| WriteOp::Delete(keys::key(hash, record)))
        .collect();
        ops.push(WriteOp::Delete(marker));

        if let Some(address) = self.get_address(hash)? {
            ops.push(WriteOp::Delete(keys::composite(
                &keys::key(&address, kind::ADDRESS),
                &key,
            )));
        }
        if let Some(bundle) = self.get_bundle(hash)? {
            ops.push(WriteOp::Delete(keys::composite(
                &keys::key(&bundle, kind::BUNDLE),
                &key,
            )));
        }
        if let Some(tag) = self.get_tag(hash)? {
            ops.push(WriteOp::Delete(keys::composite(&keys::key(&tag, kind::TAG), &key)));
        }
        let relation = self.relation(hash)?;
        if let Some((trunk, branch)) = relation {
            ops.push(WriteOp::Delete(keys::composite(
                &keys::key(&trunk, kind::APPROVEE),
                &key,
            )));
            ops.push(WriteOp::Delete(keys::composite(
                &keys::key(&branch, kind::APPROVEE),
                &key,
            )));
        }

        self.db.write(&ops)?;
        self.tips.remove(hash);
        if let Some((trunk, branch)) = relation {
            self.restore_tip(&trunk)?;
            if branch != trunk {
                self.restore_tip(&branch)?;
            }
        }
        Ok(true)
    }

    /// Re-register a stored transaction left without approvers
    ///
    /// The check runs under the registry lock. A save approving `hash` removes
    /// it from the registry only after its edge is committed.
    fn restore_tip(&self, hash: &Hash) -> Result<bool, LedgerError> {
        self.tips.insert_if(*hash, || -> Result<bool, LedgerError> {
            Ok(self.contains(hash)?
                && !self.db.has_prefix(&keys::key(hash, kind::APPROVEE))?)
        })
    }
}

fn member(key: &[u8]) -> Result<Hash, LedgerError> {
    keys::member_of(key).ok_or_else(|| LedgerError::CorruptRecord("membership key".to_string()))
}

fn missing(hash: &Hash, record: &str) -> LedgerError {
    LedgerError::CorruptRecord(format!("{} of {:?}", record, hash))
}
