// Transaction - a validated vertex of the tangle

use crate::convert::Hash;

/// Length of the canonical wire encoding of a transaction
pub const TRANSACTION_BYTES: usize = 1604;

/// A transaction as handed over by the validation pipeline
///
/// Every identifier is already packed. The transaction approves its trunk
/// (primary) and branch (secondary) references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub hash: Hash,
    pub trunk: Hash,
    pub branch: Hash,
    pub address: Hash,
    pub bundle: Hash,
    pub tag: Hash,
    /// Negative values spend from the address
    pub value: i64,
    /// Issuance time in unix seconds
    pub timestamp: i64,
    /// Position within the bundle
    pub current_index: u64,
}

impl Transaction {
    /// Create a zero-value transaction approving `trunk` and `branch`
    pub fn new(hash: Hash, trunk: Hash, branch: Hash, timestamp: i64) -> Self {
        Self {
            hash,
            trunk,
            branch,
            address: Hash::NULL,
            bundle: Hash::NULL,
            tag: Hash::NULL,
            value: 0,
            timestamp,
            current_index: 0,
        }
    }

    pub fn with_address(mut self, address: Hash) -> Self {
        self.address = address;
        self
    }

    pub fn with_value(mut self, value: i64) -> Self {
        self.value = value;
        self
    }

    pub fn with_bundle(mut self, bundle: Hash, current_index: u64) -> Self {
        self.bundle = bundle;
        self.current_index = current_index;
        self
    }

    pub fn with_tag(mut self, tag: Hash) -> Self {
        self.tag = tag;
        self
    }

    /// Check if this transaction moves value out of its address
    pub fn is_spend(&self) -> bool {
        self.value < 0
    }
}
