//! Collaborator contracts
//!
//! The coordinator never talks to a participant directly; it goes through a
//! `ParticipantClient`, which in production is an RPC stub and in tests is the
//! in-process network from `proven-engine`.

use crate::error::Result;
use crate::responses::{LocalTransactionStatus, PrepareResponse, StatementOutcome};
use async_trait::async_trait;
use proven_common::{ParticipantId, TransactionKey};
use proven_hlc::HlcTimestamp;

/// RPC stub for sending prepare/commit/abort to participants
///
/// Every method must be safe to invoke repeatedly with identical arguments.
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    /// Ask a participant to durably promise to commit
    async fn prepare(
        &self,
        participant: &ParticipantId,
        key: &TransactionKey,
    ) -> Result<PrepareResponse>;

    /// Tell a prepared participant to commit at `commit_timestamp`
    async fn commit(
        &self,
        participant: &ParticipantId,
        key: &TransactionKey,
        commit_timestamp: HlcTimestamp,
    ) -> Result<()>;

    /// Tell a participant to discard the transaction
    async fn abort(&self, participant: &ParticipantId, key: &TransactionKey) -> Result<()>;
}

/// Read-only view of the local participant's session state
///
/// This is the only way the recovery path learns about a transaction it does
/// not coordinate. Implementations answer immediately and never wait for an
/// undecided transaction. A key with a txnNumber below the session's current
/// one fails with `TransactionTooOld`; a key with a higher txnNumber first
/// supersedes whatever the session was running.
#[async_trait]
pub trait SessionQuery: Send + Sync {
    async fn recovery_status(&self, key: &TransactionKey) -> Result<LocalTransactionStatus>;
}

/// Statement execution engine seam
///
/// Applies one write statement inside a transaction and reports any other
/// participants the statement touched.
pub trait StatementExecutor: Send + Sync {
    fn execute(
        &self,
        key: &TransactionKey,
        statement: &serde_json::Value,
    ) -> Result<StatementOutcome>;
}
