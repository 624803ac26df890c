// Query service - the read surface offered to the request layer
//
// Takes identifiers in tryte form, validates them before touching storage
// and answers with serializable response bodies.

use crate::convert::{ConvertError, Hash};
use crate::snapshot::SnapshotManager;
use crate::tangle::{LedgerError, LedgerStore, RandomTipSelector, TipSelectError, TipSelector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned to API callers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Wrong hash trytes: {0}")]
    InvalidTrytes(#[from] ConvertError),

    #[error("Could not get transactions to approve: {0}")]
    TipSelection(#[from] TipSelectError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionStates {
    pub states: Vec<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipHashes {
    pub hashes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsToApprove {
    pub trunk_transaction: String,
    pub branch_transaction: String,
}

/// Read-only queries over the ledger and snapshot state
pub struct QueryService {
    ledger: Arc<LedgerStore>,
    snapshots: Arc<SnapshotManager>,
    selector: Box<dyn TipSelector>,
}

impl QueryService {
    pub fn new(ledger: Arc<LedgerStore>, snapshots: Arc<SnapshotManager>) -> Self {
        Self {
            ledger,
            snapshots,
            selector: Box::new(RandomTipSelector),
        }
    }

    /// Replace the tip selection strategy
    pub fn with_selector(mut self, selector: Box<dyn TipSelector>) -> Self {
        self.selector = selector;
        self
    }

    fn parse_all<S: AsRef<str>>(input: &[S]) -> Result<Vec<Hash>, ApiError> {
        input
            .iter()
            .map(|s| Hash::from_trytes(s.as_ref()).map_err(ApiError::from))
            .collect()
    }

    /// Confirmation state of each transaction
    pub fn get_inclusion_states<S: AsRef<str>>(
        &self,
        transactions: &[S],
    ) -> Result<InclusionStates, ApiError> {
        let hashes = Self::parse_all(transactions)?;
        let states = hashes
            .iter()
            .map(|hash| self.ledger.is_confirmed(hash))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(InclusionStates { states })
    }

    /// Spent state of each address
    pub fn were_addresses_spent_from<S: AsRef<str>>(
        &self,
        addresses: &[S],
    ) -> Result<InclusionStates, ApiError> {
        let addresses = Self::parse_all(addresses)?;
        let states = addresses
            .iter()
            .map(|address| self.ledger.is_spent(address))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(InclusionStates { states })
    }

    /// Current tips
    pub fn get_tips(&self) -> TipHashes {
        TipHashes {
            hashes: self.ledger.tips().iter().map(Hash::to_trytes).collect(),
        }
    }

    /// Trunk and branch for a new transaction
    pub fn get_transactions_to_approve(
        &self,
        depth: u32,
        reference: Option<&str>,
    ) -> Result<TransactionsToApprove, ApiError> {
        let reference = match reference {
            Some(trytes) if !trytes.is_empty() => Some(Hash::from_trytes(trytes)?),
            _ => None,
        };
        let (trunk, branch) = self.selector.select(&self.ledger, reference, depth)?;
        Ok(TransactionsToApprove {
            trunk_transaction: trunk.to_trytes(),
            branch_transaction: branch.to_trytes(),
        })
    }

    /// Cutoff of the current snapshot
    pub fn get_snapshot_timestamp(&self) -> i64 {
        self.snapshots.current_cutoff_timestamp()
    }
}
