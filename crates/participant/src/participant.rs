//! In-memory participant write path
//!
//! Applies write statements, answers prepare/commit/abort and exposes the
//! read-only recovery query. Effects of a transaction are buffered until it
//! commits, so an aborted transaction never leaves anything behind.

use crate::cache::StatementExecutionCache;
use crate::config::ParticipantConfig;
use crate::executor::EchoExecutor;
use crate::session::{AbortOutcome, Admission, CommitOutcome, SessionRecord, SessionRegistry};
use async_trait::async_trait;
use parking_lot::Mutex;
use proven_common::{ParticipantId, SessionId, StatementId, TransactionKey};
use proven_hlc::{HlcClock, HlcTimestamp, NodeId, SharedHlcClock};
use proven_protocol::{
    LocalTransactionStatus, ParticipantError, ParticipantSignal, PrepareResponse, Result,
    SessionQuery, StatementExecutor, StatementOutcome, StatementRequest,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A write that became visible when its transaction committed
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedWrite {
    pub key: TransactionKey,
    pub statement_id: StatementId,
    pub commit_timestamp: HlcTimestamp,
    pub value: serde_json::Value,
}

struct ParticipantState {
    sessions: SessionRegistry,
    cache: StatementExecutionCache,
    /// Buffered writes of transactions that have not committed
    pending: HashMap<TransactionKey, Vec<(StatementId, serde_json::Value)>>,
    committed: Vec<CommittedWrite>,
}

impl ParticipantState {
    fn discard(&mut self, key: &TransactionKey) {
        let purged = self.cache.purge(key);
        let dropped = self.pending.remove(key).map_or(0, |writes| writes.len());
        tracing::debug!(
            "Discarded {} cached results and {} pending writes for {}",
            purged,
            dropped,
            key
        );
    }
}

/// One data partition taking part in distributed transactions
pub struct Participant {
    id: ParticipantId,
    clock: SharedHlcClock,
    executor: Arc<dyn StatementExecutor>,
    state: Mutex<ParticipantState>,
    executions: AtomicU64,
}

impl Participant {
    pub fn new(
        id: ParticipantId,
        config: ParticipantConfig,
        clock: SharedHlcClock,
        executor: Arc<dyn StatementExecutor>,
    ) -> Self {
        Self {
            id,
            clock,
            executor,
            state: Mutex::new(ParticipantState {
                sessions: SessionRegistry::new(config.resolved_history_limit),
                cache: StatementExecutionCache::new(),
                pending: HashMap::new(),
                committed: Vec::new(),
            }),
            executions: AtomicU64::new(0),
        }
    }

    /// Participant with a manual clock and the echo executor
    pub fn in_memory(id: impl Into<ParticipantId>) -> Self {
        let id = id.into();
        let clock = Arc::new(HlcClock::manual(NodeId::from_name(id.as_str())));
        Self::new(id, ParticipantConfig::default(), clock, Arc::new(EchoExecutor))
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn clock(&self) -> &SharedHlcClock {
        &self.clock
    }

    /// Apply one write statement.
    ///
    /// A statement whose id already has a cached result for this attempt is
    /// answered from the cache without running again.
    pub fn execute_statement(&self, request: &StatementRequest) -> Result<StatementOutcome> {
        let key = &request.key;
        let mut state = self.state.lock();

        match state.sessions.admit_statement(key, request.start_transaction)? {
            Admission::Started { superseded } => {
                if let Some(old) = superseded {
                    tracing::info!("{} superseded by {} on {}", old, key, self.id);
                    state.discard(&old);
                }
            }
            Admission::Restarted => {
                return match state
                    .cache
                    .replay(key, request.statement_id, &request.statement)?
                {
                    Some(outcome) => Ok(outcome.clone()),
                    None => Err(ParticipantError::ConflictingOperationInProgress(*key)),
                };
            }
            Admission::Continued => {
                if let Some(outcome) =
                    state
                        .cache
                        .replay(key, request.statement_id, &request.statement)?
                {
                    tracing::debug!("Replaying {} of {} from cache", request.statement_id, key);
                    return Ok(outcome.clone());
                }
            }
        }

        let outcome = self.executor.execute(key, &request.statement)?;
        self.executions.fetch_add(1, Ordering::Relaxed);

        let touched = outcome.signal.unknown_to(std::slice::from_ref(&self.id));
        let op_time = self.clock.now();
        state.sessions.record_write(key, op_time, touched);
        state
            .pending
            .entry(*key)
            .or_default()
            .push((request.statement_id, request.statement.clone()));
        state
            .cache
            .record_result(key, request.statement_id, &request.statement, outcome.clone());

        Ok(outcome)
    }

    /// Durably promise to commit; answers with the prepare timestamp
    pub fn prepare(&self, key: &TransactionKey) -> Result<PrepareResponse> {
        let mut state = self.state.lock();
        let prepared = state.sessions.prepare(key, || self.clock.now())?;

        if prepared.newly_prepared {
            tracing::debug!(
                "{} prepared {} at {}",
                self.id,
                key,
                prepared.prepare_timestamp
            );
        }

        Ok(PrepareResponse {
            prepare_timestamp: Some(prepared.prepare_timestamp),
            signal: ParticipantSignal::from_participants(prepared.touched),
        })
    }

    /// Commit a prepared transaction, making its writes visible
    pub fn commit(&self, key: &TransactionKey, commit_timestamp: HlcTimestamp) -> Result<()> {
        let mut state = self.state.lock();

        if state.sessions.commit(key, commit_timestamp)? == CommitOutcome::Applied {
            self.clock.update(&commit_timestamp);
            let writes = state.pending.remove(key).unwrap_or_default();
            tracing::debug!(
                "{} committed {} at {} ({} writes)",
                self.id,
                key,
                commit_timestamp,
                writes.len()
            );
            state
                .committed
                .extend(writes.into_iter().map(|(statement_id, value)| CommittedWrite {
                    key: *key,
                    statement_id,
                    commit_timestamp,
                    value,
                }));
        }
        Ok(())
    }

    /// Abort the transaction and drop everything it did
    pub fn abort(&self, key: &TransactionKey) -> Result<()> {
        let mut state = self.state.lock();

        if let AbortOutcome::Aborted(aborted) = state.sessions.abort(key)? {
            tracing::debug!("{} aborted {}", self.id, aborted);
            state.discard(&aborted);
        }
        Ok(())
    }

    /// Read-only status of a transaction on this participant
    pub fn status(&self, key: &TransactionKey) -> LocalTransactionStatus {
        self.state.lock().sessions.status(key)
    }

    pub fn session_record(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.state.lock().sessions.get(session_id).cloned()
    }

    pub fn cached_result(
        &self,
        key: &TransactionKey,
        statement_id: StatementId,
    ) -> Option<StatementOutcome> {
        self.state.lock().cache.lookup(key, statement_id).cloned()
    }

    /// Writes of every committed transaction, in commit order
    pub fn committed_writes(&self) -> Vec<CommittedWrite> {
        self.state.lock().committed.clone()
    }

    /// Committed writes of one transaction
    pub fn committed_writes_for(&self, key: &TransactionKey) -> Vec<CommittedWrite> {
        self.state
            .lock()
            .committed
            .iter()
            .filter(|write| &write.key == key)
            .cloned()
            .collect()
    }

    /// Number of statements actually run by the executor
    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SessionQuery for Participant {
    async fn recovery_status(&self, key: &TransactionKey) -> Result<LocalTransactionStatus> {
        let mut state = self.state.lock();
        let (status, aborted) = state.sessions.recovery_status(key)?;
        if let Some(aborted) = aborted {
            tracing::info!(
                "Recovery query for {} implicitly aborted {} on {}",
                key,
                aborted,
                self.id
            );
            state.discard(&aborted);
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn start(key: TransactionKey, id: u32, statement: serde_json::Value) -> StatementRequest {
        StatementRequest::start(key, StatementId(id), statement)
    }

    fn next(key: TransactionKey, id: u32, statement: serde_json::Value) -> StatementRequest {
        StatementRequest::continuing(key, StatementId(id), statement)
    }

    #[test]
    fn test_writes_visible_only_after_commit() {
        let participant = Participant::in_memory("shard-a");
        let key = TransactionKey::new(SessionId::new(), 1);

        participant
            .execute_statement(&start(key, 0, json!({"set": "x"})))
            .unwrap();
        participant
            .execute_statement(&next(key, 1, json!({"set": "y"})))
            .unwrap();
        assert!(participant.committed_writes().is_empty());

        let prepared = participant.prepare(&key).unwrap();
        let prepare_ts = prepared.prepare_timestamp.unwrap();
        participant.commit(&key, prepare_ts.tick()).unwrap();
        participant.commit(&key, prepare_ts.tick()).unwrap();

        let writes = participant.committed_writes_for(&key);
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| w.commit_timestamp == prepare_ts.tick()));
        assert_eq!(
            participant.status(&key),
            LocalTransactionStatus::Committed(prepare_ts.tick())
        );
    }

    #[test]
    fn test_verbatim_retry_replays_cached_result() {
        let participant = Participant::in_memory("shard-a");
        let key = TransactionKey::new(SessionId::new(), 1);
        let request = start(key, 0, json!({"set": "x"}));

        let first = participant.execute_statement(&request).unwrap();
        let retried = participant.execute_statement(&request).unwrap();
        assert_eq!(first, retried);
        assert_eq!(participant.execution_count(), 1);

        // A different first statement under the same txnNumber is a conflict
        assert_eq!(
            participant.execute_statement(&start(key, 5, json!({"set": "z"}))),
            Err(ParticipantError::ConflictingOperationInProgress(key))
        );
    }

    #[test]
    fn test_reused_statement_id_with_new_body_conflicts() {
        let participant = Participant::in_memory("shard-a");
        let key = TransactionKey::new(SessionId::new(), 1);
        let first = participant
            .execute_statement(&start(key, 0, json!({"set": "x"})))
            .unwrap();
        participant
            .execute_statement(&next(key, 1, json!({"set": "y"})))
            .unwrap();

        assert_eq!(
            participant.execute_statement(&start(key, 0, json!({"set": "other"}))),
            Err(ParticipantError::ConflictingOperationInProgress(key))
        );
        assert_eq!(
            participant.execute_statement(&next(key, 1, json!({"set": "other"}))),
            Err(ParticipantError::ConflictingOperationInProgress(key))
        );
        assert_eq!(participant.execution_count(), 2);
        assert_eq!(
            participant.cached_result(&key, StatementId(0)),
            Some(first)
        );
    }

    #[test]
    fn test_abort_purges_cache_and_retry_reexecutes() {
        let participant = Participant::in_memory("shard-a");
        let session = SessionId::new();
        let t1 = TransactionKey::new(session, 1);

        participant
            .execute_statement(&start(t1, 0, json!({"v": 1})))
            .unwrap();
        participant.abort(&t1).unwrap();
        participant.abort(&t1).unwrap();

        assert!(participant.cached_result(&t1, StatementId(0)).is_none());
        assert!(participant.committed_writes().is_empty());

        // The caller retries the whole transaction under a new txnNumber
        let t2 = t1.next();
        let outcome = participant
            .execute_statement(&start(t2, 0, json!({"v": 2})))
            .unwrap();
        assert_eq!(outcome.result, json!({"v": 2}));
        assert_eq!(participant.execution_count(), 2);
    }

    #[test]
    fn test_touched_participants_reported_on_prepare() {
        let participant = Participant::in_memory("shard-a");
        let key = TransactionKey::new(SessionId::new(), 1);

        participant
            .execute_statement(&start(key, 0, json!({"touches": ["shard-a", "shard-c"]})))
            .unwrap();

        let response = participant.prepare(&key).unwrap();
        assert_eq!(
            response.signal,
            ParticipantSignal::AdditionalParticipants(
                [ParticipantId::new("shard-c")].into_iter().collect()
            )
        );
    }

    #[test]
    fn test_failed_statement_is_not_cached() {
        let participant = Participant::in_memory("shard-a");
        let key = TransactionKey::new(SessionId::new(), 1);

        assert!(participant
            .execute_statement(&start(key, 0, json!({"fail": true})))
            .is_err());
        assert!(participant.cached_result(&key, StatementId(0)).is_none());
        assert_eq!(participant.execution_count(), 0);
    }

    #[tokio::test]
    async fn test_recovery_query_supersedes_in_progress() {
        let participant = Participant::in_memory("shard-a");
        let t1 = TransactionKey::new(SessionId::new(), 1);
        participant
            .execute_statement(&start(t1, 0, json!({"v": 1})))
            .unwrap();

        let status = participant.recovery_status(&t1.next()).await.unwrap();
        assert_eq!(status, LocalTransactionStatus::Superseded);
        assert_eq!(participant.status(&t1), LocalTransactionStatus::Aborted);
        assert!(participant.cached_result(&t1, StatementId(0)).is_none());
        assert_eq!(
            participant.commit(&t1, HlcTimestamp::new(0, 9, NodeId::new(1))),
            Err(ParticipantError::NoSuchTransaction(t1))
        );
    }
}
