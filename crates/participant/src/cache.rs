//! Per-transaction cache of already-applied write statements
//!
//! A verbatim retry of a statement with a cached result is answered from the
//! cache instead of being applied twice. Only the current attempt of each session is kept:
//! results from a different txnNumber are never visible, and an abort discards
//! everything recorded for the attempt.

use proven_common::{SessionId, StatementId, TransactionKey, TxnNumber};
use proven_protocol::{ParticipantError, Result, StatementOutcome};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug)]
struct CachedStatement {
    statement: Value,
    outcome: StatementOutcome,
}

#[derive(Debug)]
struct CachedAttempt {
    txn_number: TxnNumber,
    results: HashMap<StatementId, CachedStatement>,
}

impl CachedAttempt {
    fn new(txn_number: TxnNumber) -> Self {
        Self {
            txn_number,
            results: HashMap::new(),
        }
    }
}

/// Statement results for the current transaction attempt of each session
#[derive(Debug, Default)]
pub struct StatementExecutionCache {
    attempts: HashMap<SessionId, CachedAttempt>,
}

impl StatementExecutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result of a statement.
    ///
    /// The first result recorded for a statement id wins. Recording for a
    /// newer txnNumber drops the session's older attempt; recording for an
    /// older txnNumber is ignored.
    pub fn record_result(
        &mut self,
        key: &TransactionKey,
        statement_id: StatementId,
        statement: &Value,
        result: StatementOutcome,
    ) {
        let attempt = self
            .attempts
            .entry(key.session_id)
            .or_insert_with(|| CachedAttempt::new(key.txn_number));

        if key.txn_number < attempt.txn_number {
            return;
        }
        if key.txn_number > attempt.txn_number {
            *attempt = CachedAttempt::new(key.txn_number);
        }

        attempt
            .results
            .entry(statement_id)
            .or_insert_with(|| CachedStatement {
                statement: statement.clone(),
                outcome: result,
            });
    }

    fn cached(&self, key: &TransactionKey, statement_id: StatementId) -> Option<&CachedStatement> {
        self.attempts
            .get(&key.session_id)
            .filter(|attempt| attempt.txn_number == key.txn_number)
            .and_then(|attempt| attempt.results.get(&statement_id))
    }

    /// Cached result for a statement of this exact transaction attempt
    pub fn lookup(
        &self,
        key: &TransactionKey,
        statement_id: StatementId,
    ) -> Option<&StatementOutcome> {
        self.cached(key, statement_id).map(|cached| &cached.outcome)
    }

    /// Cached result if `statement` repeats the one recorded under its id.
    ///
    /// A different statement reusing a recorded id is a conflict.
    pub fn replay(
        &self,
        key: &TransactionKey,
        statement_id: StatementId,
        statement: &Value,
    ) -> Result<Option<&StatementOutcome>> {
        match self.cached(key, statement_id) {
            None => Ok(None),
            Some(cached) if cached.statement == *statement => Ok(Some(&cached.outcome)),
            Some(_) => Err(ParticipantError::ConflictingOperationInProgress(*key)),
        }
    }

    /// Discard every cached result of this attempt.
    ///
    /// Returns the number of results dropped.
    pub fn purge(&mut self, key: &TransactionKey) -> usize {
        match self.attempts.get(&key.session_id) {
            Some(attempt) if attempt.txn_number == key.txn_number => self
                .attempts
                .remove(&key.session_id)
                .map_or(0, |attempt| attempt.results.len()),
            _ => 0,
        }
    }

    /// Number of results cached for this attempt
    pub fn len_for(&self, key: &TransactionKey) -> usize {
        self.attempts
            .get(&key.session_id)
            .filter(|attempt| attempt.txn_number == key.txn_number)
            .map_or(0, |attempt| attempt.results.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(n: i64) -> StatementOutcome {
        StatementOutcome::normal(json!(n))
    }

    fn statement(n: u32) -> Value {
        json!({ "set": n })
    }

    #[test]
    fn test_lookup_is_scoped_to_attempt() {
        let session = SessionId::new();
        let t1 = TransactionKey::new(session, 1);
        let t2 = TransactionKey::new(session, 2);

        let mut cache = StatementExecutionCache::new();
        cache.record_result(&t1, StatementId(0), &statement(0), outcome(10));

        assert_eq!(cache.lookup(&t1, StatementId(0)), Some(&outcome(10)));
        assert!(cache.lookup(&t1, StatementId(1)).is_none());
        assert!(cache.lookup(&t2, StatementId(0)).is_none());
    }

    #[test]
    fn test_first_result_wins() {
        let key = TransactionKey::new(SessionId::new(), 1);
        let mut cache = StatementExecutionCache::new();

        cache.record_result(&key, StatementId(0), &statement(0), outcome(1));
        cache.record_result(&key, StatementId(0), &statement(0), outcome(2));

        assert_eq!(cache.lookup(&key, StatementId(0)), Some(&outcome(1)));
    }

    #[test]
    fn test_newer_attempt_replaces_older() {
        let session = SessionId::new();
        let t1 = TransactionKey::new(session, 1);
        let t2 = TransactionKey::new(session, 2);

        let mut cache = StatementExecutionCache::new();
        cache.record_result(&t1, StatementId(0), &statement(0), outcome(1));
        cache.record_result(&t2, StatementId(0), &statement(0), outcome(2));
        // Late result for the superseded attempt is dropped
        cache.record_result(&t1, StatementId(1), &statement(1), outcome(3));

        assert!(cache.lookup(&t1, StatementId(0)).is_none());
        assert!(cache.lookup(&t1, StatementId(1)).is_none());
        assert_eq!(cache.lookup(&t2, StatementId(0)), Some(&outcome(2)));
    }

    #[test]
    fn test_purge_removes_everything_for_attempt() {
        let session = SessionId::new();
        let t1 = TransactionKey::new(session, 1);
        let mut cache = StatementExecutionCache::new();
        cache.record_result(&t1, StatementId(0), &statement(0), outcome(1));
        cache.record_result(&t1, StatementId(1), &statement(1), outcome(2));

        // Purging another attempt of the same session leaves this one alone
        assert_eq!(cache.purge(&t1.next()), 0);
        assert_eq!(cache.len_for(&t1), 2);

        assert_eq!(cache.purge(&t1), 2);
        assert!(cache.lookup(&t1, StatementId(0)).is_none());
        assert!(cache.lookup(&t1, StatementId(1)).is_none());
        assert_eq!(cache.len_for(&t1), 0);
    }

    #[test]
    fn test_replay_requires_same_statement() {
        let key = TransactionKey::new(SessionId::new(), 1);
        let mut cache = StatementExecutionCache::new();
        cache.record_result(&key, StatementId(0), &statement(0), outcome(1));

        assert_eq!(
            cache.replay(&key, StatementId(0), &statement(0)).unwrap(),
            Some(&outcome(1))
        );
        assert!(matches!(
            cache.replay(&key, StatementId(0), &statement(9)),
            Err(ParticipantError::ConflictingOperationInProgress(_))
        ));
        assert_eq!(cache.replay(&key, StatementId(1), &statement(9)).unwrap(), None);
        assert_eq!(cache.replay(&key.next(), StatementId(0), &statement(9)).unwrap(), None);
    }
}
