// Tangle module - THE TRANSACTION GRAPH
// Handles transaction persistence, the tip registry and tip selection

mod ledger;
mod tips;
mod tipsel;
mod transaction;

pub use ledger::{LedgerError, LedgerStore};
pub use tips::TipSet;
pub use tipsel::{
    check_depth, RandomTipSelector, TipSelectError, TipSelector, MAX_TIPSEL_DEPTH,
    MIN_TIPSEL_DEPTH,
};
pub use transaction::{Transaction, TRANSACTION_BYTES};
