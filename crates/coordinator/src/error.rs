//! Error types for the coordinator

use crate::store::StoreError;
use proven_common::{TransactionKey, TxnNumber};
use proven_protocol::ParticipantError;
use thiserror::Error;

/// Coordinator error types
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Commit coordination for {0} requires at least one participant")]
    EmptyParticipantList(TransactionKey),

    #[error("Transaction {key} is too old, session is already at txnNumber {active}")]
    TransactionTooOld {
        key: TransactionKey,
        active: TxnNumber,
    },

    #[error("No such transaction: {0}")]
    NoSuchTransaction(TransactionKey),

    #[error("Coordinator is stepping down")]
    SteppingDown,

    #[error("Epoch {requested} is not newer than current epoch {current}")]
    StaleEpoch { requested: u64, current: u64 },

    #[error("Coordinator for {key} gave up without a decision: {reason}")]
    Abandoned { key: TransactionKey, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Participant error: {0}")]
    Participant(ParticipantError),
}

impl From<ParticipantError> for CoordinatorError {
    fn from(error: ParticipantError) -> Self {
        match error {
            ParticipantError::TransactionTooOld { key, active } => {
                Self::TransactionTooOld { key, active }
            }
            ParticipantError::NoSuchTransaction(key) => Self::NoSuchTransaction(key),
            other => Self::Participant(other),
        }
    }
}

impl CoordinatorError {
    /// Stale-request errors are surfaced immediately and never retried
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::TransactionTooOld { .. })
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
