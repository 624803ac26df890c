// Tip selection - choosing the two transactions a new one should approve

use crate::convert::Hash;
use crate::tangle::ledger::{LedgerError, LedgerStore};
use rand::seq::SliceRandom;
use thiserror::Error;

pub const MIN_TIPSEL_DEPTH: u32 = 1;
pub const MAX_TIPSEL_DEPTH: u32 = 15;

/// Errors from tip selection
#[derive(Error, Debug)]
pub enum TipSelectError {
    #[error("Invalid depth {0}: must be between 1 and 15")]
    InvalidDepth(u32),

    #[error("Reference transaction is not stored")]
    UnknownReference,

    #[error("No tips available")]
    NoTips,

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Picks a trunk and branch for a new transaction
pub trait TipSelector: Send + Sync {
    /// Select `(trunk, branch)`
    ///
    /// With a reference, the selection must approve it (directly or through
    /// the walk). `depth` bounds how far back the walk may start.
    fn select(
        &self,
        ledger: &LedgerStore,
        reference: Option<Hash>,
        depth: u32,
    ) -> Result<(Hash, Hash), TipSelectError>;
}

/// Check the depth bounds every selector must honour
pub fn check_depth(depth: u32) -> Result<(), TipSelectError> {
    if !(MIN_TIPSEL_DEPTH..=MAX_TIPSEL_DEPTH).contains(&depth) {
        return Err(TipSelectError::InvalidDepth(depth));
    }
    Ok(())
}

/// Uniform pick from the current tips
///
/// The reference, when given, becomes the trunk.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomTipSelector;

impl TipSelector for RandomTipSelector {
    fn select(
        &self,
        ledger: &LedgerStore,
        reference: Option<Hash>,
        depth: u32,
    ) -> Result<(Hash, Hash), TipSelectError> {
        check_depth(depth)?;
        if let Some(reference) = reference {
            if !ledger.contains(&reference)? {
                return Err(TipSelectError::UnknownReference);
            }
        }

        let tips = ledger.tips();
        let mut rng = rand::thread_rng();
        let branch = *tips.choose(&mut rng).ok_or(TipSelectError::NoTips)?;
        let trunk = match reference {
            Some(reference) => reference,
            None => *tips.choose(&mut rng).ok_or(TipSelectError::NoTips)?,
        };
        Ok((trunk, branch))
    }
}
