//! Outcome reconstruction for keys with no live coordinator and no document
//!
//! Only the local participant's session state is consulted. Anything short of
//! a definitive commit answers `NoSuchTransaction`, which callers treat as
//! "already resolved or never committed".

use crate::error::{CoordinatorError, Result};
use proven_common::{ParticipantId, TransactionKey};
use proven_protocol::{CommitDecision, LocalTransactionStatus, SessionQuery};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct RecoveryService {
    local: Option<(ParticipantId, Arc<dyn SessionQuery>)>,
}

impl RecoveryService {
    /// Recovery without a co-located participant always answers
    /// `NoSuchTransaction`
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_participant(id: ParticipantId, query: Arc<dyn SessionQuery>) -> Self {
        Self {
            local: Some((id, query)),
        }
    }

    /// The co-located participant, if any
    pub fn local_participant(&self) -> Option<&ParticipantId> {
        self.local.as_ref().map(|(id, _)| id)
    }

    /// Answer a commit query from local session state alone.
    ///
    /// Never waits on an undecided transaction. A stale txnNumber fails with
    /// `TransactionTooOld`.
    pub async fn resolve(&self, key: &TransactionKey) -> Result<CommitDecision> {
        let Some((participant, query)) = &self.local else {
            tracing::debug!("No local participant to recover {}", key);
            return Err(CoordinatorError::NoSuchTransaction(*key));
        };

        let status = query.recovery_status(key).await?;
        tracing::debug!(
            "Local participant {} reports {:?} for {}",
            participant,
            status,
            key
        );

        match status {
            LocalTransactionStatus::Committed(commit_timestamp) => {
                Ok(CommitDecision::Commit { commit_timestamp })
            }
            LocalTransactionStatus::Unknown
            | LocalTransactionStatus::InProgress
            | LocalTransactionStatus::Prepared
            | LocalTransactionStatus::Aborted
            | LocalTransactionStatus::Superseded => {
                Err(CoordinatorError::NoSuchTransaction(*key))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proven_common::{SessionId, StatementId};
    use proven_hlc::HlcTimestamp;
    use proven_participant::Participant;
    use proven_protocol::StatementRequest;
    use serde_json::json;

    fn local() -> (Arc<Participant>, RecoveryService) {
        let participant = Arc::new(Participant::in_memory("local"));
        let service = RecoveryService::with_local_participant(
            participant.id().clone(),
            participant.clone(),
        );
        (participant, service)
    }

    fn start(participant: &Participant, key: TransactionKey) {
        participant
            .execute_statement(&StatementRequest::start(key, StatementId(0), json!({"x": 1})))
            .unwrap();
    }

    #[tokio::test]
    async fn test_committed_transaction_recovers_its_decision() {
        let (participant, recovery) = local();
        let key = TransactionKey::new(SessionId::new(), 1);
        start(&participant, key);
        let prepare_timestamp = participant.prepare(&key).unwrap().prepare_timestamp.unwrap();
        let commit_timestamp = prepare_timestamp.tick();
        participant.commit(&key, commit_timestamp).unwrap();

        assert_eq!(
            recovery.resolve(&key).await.unwrap(),
            CommitDecision::Commit { commit_timestamp }
        );
    }

    #[tokio::test]
    async fn test_undecided_transactions_are_not_waited_on() {
        let (participant, recovery) = local();
        let key = TransactionKey::new(SessionId::new(), 1);

        assert!(matches!(
            recovery.resolve(&key).await,
            Err(CoordinatorError::NoSuchTransaction(_))
        ));

        start(&participant, key);
        assert!(matches!(
            recovery.resolve(&key).await,
            Err(CoordinatorError::NoSuchTransaction(_))
        ));

        participant.prepare(&key).unwrap();
        assert!(matches!(
            recovery.resolve(&key).await,
            Err(CoordinatorError::NoSuchTransaction(_))
        ));
        assert_eq!(participant.status(&key), LocalTransactionStatus::Prepared);
    }

    #[tokio::test]
    async fn test_newer_key_fences_and_older_key_is_stale() {
        let (participant, recovery) = local();
        let session = SessionId::new();
        let t1 = TransactionKey::new(session, 1);
        let t2 = TransactionKey::new(session, 2);
        start(&participant, t1);

        assert!(matches!(
            recovery.resolve(&t2).await,
            Err(CoordinatorError::NoSuchTransaction(_))
        ));
        assert!(matches!(
            recovery.resolve(&t1).await,
            Err(CoordinatorError::TransactionTooOld { .. })
        ));
        assert!(participant.commit(&t1, HlcTimestamp::new(0, 9, participant.clock().node_id())).is_err());
    }

    #[tokio::test]
    async fn test_without_local_participant() {
        let recovery = RecoveryService::new();
        assert!(recovery.local_participant().is_none());
        assert!(matches!(
            recovery
                .resolve(&TransactionKey::new(SessionId::new(), 1))
                .await,
            Err(CoordinatorError::NoSuchTransaction(_))
        ));
    }
}
