//! Error taxonomy for the keeper.
//!
//! Every failure mode is scoped to the (instrument, side) key that
//! produced it; one key's error never aborts the cycle for another.

use rust_decimal::Decimal;
use thiserror::Error;

/// Keeper error classification.
#[derive(Error, Debug)]
pub enum KeeperError {
    /// Gateway unreachable or returned a non-2xx status. The gateway
    /// client owns transport retries; callers do not retry locally.
    #[error("gateway transport error: {0}")]
    Transport(String),

    /// An expected position is missing from the snapshot. Treated as
    /// already closed, not fatal.
    #[error("position not in snapshot: {0}")]
    DataUnavailable(String),

    /// Live margin is approximately zero, so a reduce ratio cannot be
    /// computed. The cycle is skipped and retried naturally next tick.
    #[error("sizing undefined for {key}: live margin {margin} too close to zero")]
    SizingUndefined { key: String, margin: Decimal },

    /// A correction run spent all its retries without converging.
    #[error("convergence exhausted for {key} after {attempts} attempts (final deviation {deviation}U)")]
    ConvergenceExhausted {
        key: String,
        attempts: u32,
        deviation: Decimal,
    },

    /// Storage-layer failure; retry discretion belongs to the storage
    /// engine, never duplicated here.
    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl KeeperError {
    /// Whether this error ends the current run but should leave the
    /// position eligible for a fresh run on the next cycle.
    pub fn is_retriable_next_cycle(&self) -> bool {
        matches!(
            self,
            KeeperError::Transport(_)
                | KeeperError::SizingUndefined { .. }
                | KeeperError::Persistence(_)
        )
    }
}
