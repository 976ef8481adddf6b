//! Errors returned by participants

use proven_common::{ParticipantId, TransactionKey, TxnNumber};
use thiserror::Error;

/// Result type for participant RPCs
pub type Result<T> = std::result::Result<T, ParticipantError>;

/// Participant error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParticipantError {
    #[error("Participant {0} is unreachable")]
    NetworkPartition(ParticipantId),

    #[error("Participant {0} is not writable")]
    NotWritable(ParticipantId),

    #[error("Request to participant {0} was interrupted")]
    Interrupted(ParticipantId),

    #[error("No such transaction: {0}")]
    NoSuchTransaction(TransactionKey),

    #[error("Transaction {key} is too old, session is already at txnNumber {active}")]
    TransactionTooOld {
        key: TransactionKey,
        active: TxnNumber,
    },

    #[error("Transaction {0} is already running on this session")]
    ConflictingOperationInProgress(TransactionKey),

    #[error("Transaction {0} is prepared and awaiting a decision")]
    PreparedTransactionInProgress(TransactionKey),

    #[error("Transaction {0} has not been prepared")]
    NotPrepared(TransactionKey),

    #[error("Transaction {0} has already committed")]
    TransactionCommitted(TransactionKey),

    #[error("Unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    #[error("Statement failed: {0}")]
    StatementFailed(String),
}

impl ParticipantError {
    /// Infrastructure failures that say nothing about the transaction itself.
    ///
    /// These are retried with backoff at every call site and never decide an
    /// outcome on their own.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NetworkPartition(_) | Self::NotWritable(_) | Self::Interrupted(_)
        )
    }

    /// Requests addressed to a transaction the session has moved past
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::TransactionTooOld { .. })
    }

    /// The participant has no record of the transaction (already resolved or never started)
    pub fn is_no_such_transaction(&self) -> bool {
        matches!(self, Self::NoSuchTransaction(_))
    }
}
