//! Per-session transaction bookkeeping
//!
//! Each session runs at most one transaction at a time. The registry records
//! the session's latest txnNumber and the state of that transaction, and
//! fences every request against it: older txnNumbers are rejected, newer ones
//! supersede whatever was running. Transactions the session has moved past are
//! kept in a short resolved history so late commit/prepare retries stay
//! idempotent.

use proven_common::{ParticipantId, SessionId, TransactionKey, TxnNumber};
use proven_hlc::HlcTimestamp;
use proven_protocol::{LocalTransactionStatus, ParticipantError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// State of the latest transaction of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    InProgress,
    Prepared,
    Committed,
    Aborted,
}

/// How a transaction the session moved past ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedTransaction {
    Committed {
        prepare_timestamp: HlcTimestamp,
        commit_timestamp: HlcTimestamp,
    },
    Aborted,
}

/// Everything a participant knows about one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub last_txn_number: TxnNumber,
    /// Time of the last write applied on behalf of the session
    pub last_write_op_time: Option<HlcTimestamp>,
    pub txn_state: TxnState,
    pub prepare_timestamp: Option<HlcTimestamp>,
    pub commit_timestamp: Option<HlcTimestamp>,
    /// Other participants the current transaction touched through this one
    pub touched: BTreeSet<ParticipantId>,
    history: VecDeque<(TxnNumber, ResolvedTransaction)>,
}

impl SessionRecord {
    fn new(txn_number: TxnNumber, txn_state: TxnState) -> Self {
        Self {
            last_txn_number: txn_number,
            last_write_op_time: None,
            txn_state,
            prepare_timestamp: None,
            commit_timestamp: None,
            touched: BTreeSet::new(),
            history: VecDeque::new(),
        }
    }

    /// Move the current transaction into history and start tracking `txn_number`
    fn advance(&mut self, txn_number: TxnNumber, txn_state: TxnState, history_limit: usize) {
        let resolved = match (self.txn_state, self.prepare_timestamp, self.commit_timestamp) {
            (TxnState::Committed, Some(prepare_timestamp), Some(commit_timestamp)) => {
                ResolvedTransaction::Committed {
                    prepare_timestamp,
                    commit_timestamp,
                }
            }
            _ => ResolvedTransaction::Aborted,
        };

        self.history.push_back((self.last_txn_number, resolved));
        while self.history.len() > history_limit {
            self.history.pop_front();
        }

        self.last_txn_number = txn_number;
        self.txn_state = txn_state;
        self.prepare_timestamp = None;
        self.commit_timestamp = None;
        self.touched.clear();
    }

    /// Outcome of an earlier transaction, if still remembered
    pub fn resolved(&self, txn_number: TxnNumber) -> Option<ResolvedTransaction> {
        self.history
            .iter()
            .rev()
            .find(|(number, _)| *number == txn_number)
            .map(|(_, resolved)| *resolved)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// Result of admitting a write statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new transaction was opened; carries the running one it aborted, if any
    Started { superseded: Option<TransactionKey> },
    /// The running transaction was asked to start again
    Restarted,
    /// A follow-up statement of the running transaction
    Continued,
}

/// Result of a prepare request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub prepare_timestamp: HlcTimestamp,
    pub touched: BTreeSet<ParticipantId>,
    /// False when the transaction was already prepared or committed
    pub newly_prepared: bool,
}

/// Result of a commit request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    AlreadyCommitted,
}

/// Result of an abort request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// A tracked transaction was aborted and its effects must be discarded
    Aborted(TransactionKey),
    /// Nothing to undo
    NoOp,
}

/// Session records of one participant
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, SessionRecord>,
    history_limit: usize,
}

impl SessionRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            history_limit,
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&SessionRecord> {
        self.sessions.get(session_id)
    }

    fn too_old(key: &TransactionKey, record: &SessionRecord) -> ParticipantError {
        ParticipantError::TransactionTooOld {
            key: *key,
            active: record.last_txn_number,
        }
    }

    /// Fence a write statement against the session's current transaction
    pub fn admit_statement(&mut self, key: &TransactionKey, start: bool) -> Result<Admission> {
        let Some(record) = self.sessions.get_mut(&key.session_id) else {
            if !start {
                return Err(ParticipantError::NoSuchTransaction(*key));
            }
            self.sessions.insert(
                key.session_id,
                SessionRecord::new(key.txn_number, TxnState::InProgress),
            );
            return Ok(Admission::Started { superseded: None });
        };

        if key.txn_number < record.last_txn_number {
            return Err(Self::too_old(key, record));
        }

        if key.txn_number > record.last_txn_number {
            if !start {
                return Err(ParticipantError::NoSuchTransaction(*key));
            }
            let current = TransactionKey::new(key.session_id, record.last_txn_number);
            let superseded = match record.txn_state {
                TxnState::Prepared => {
                    return Err(ParticipantError::PreparedTransactionInProgress(current));
                }
                TxnState::InProgress => Some(current),
                TxnState::Committed | TxnState::Aborted => None,
            };
            record.advance(key.txn_number, TxnState::InProgress, self.history_limit);
            return Ok(Admission::Started { superseded });
        }

        match record.txn_state {
            TxnState::InProgress if start => Ok(Admission::Restarted),
            TxnState::InProgress => Ok(Admission::Continued),
            TxnState::Prepared => Err(ParticipantError::PreparedTransactionInProgress(*key)),
            TxnState::Committed => Err(ParticipantError::TransactionCommitted(*key)),
            TxnState::Aborted => Err(ParticipantError::NoSuchTransaction(*key)),
        }
    }

    /// Note a write applied by the running transaction
    pub fn record_write(
        &mut self,
        key: &TransactionKey,
        op_time: HlcTimestamp,
        touched: impl IntoIterator<Item = ParticipantId>,
    ) {
        if let Some(record) = self.sessions.get_mut(&key.session_id)
            && record.last_txn_number == key.txn_number
        {
            record.last_write_op_time = Some(op_time);
            record.touched.extend(touched);
        }
    }

    /// Move the transaction to `Prepared`, using `now` for the prepare timestamp
    pub fn prepare(
        &mut self,
        key: &TransactionKey,
        now: impl FnOnce() -> HlcTimestamp,
    ) -> Result<Prepared> {
        let Some(record) = self.sessions.get_mut(&key.session_id) else {
            return Err(ParticipantError::NoSuchTransaction(*key));
        };

        if key.txn_number < record.last_txn_number {
            return match record.resolved(key.txn_number) {
                Some(ResolvedTransaction::Committed {
                    prepare_timestamp, ..
                }) => Ok(Prepared {
                    prepare_timestamp,
                    touched: BTreeSet::new(),
                    newly_prepared: false,
                }),
                Some(ResolvedTransaction::Aborted) => {
                    Err(ParticipantError::NoSuchTransaction(*key))
                }
                None => Err(Self::too_old(key, record)),
            };
        }
        if key.txn_number > record.last_txn_number {
            return Err(ParticipantError::NoSuchTransaction(*key));
        }

        match (record.txn_state, record.prepare_timestamp) {
            (TxnState::InProgress, _) => {
                let prepare_timestamp = now();
                record.txn_state = TxnState::Prepared;
                record.prepare_timestamp = Some(prepare_timestamp);
                record.last_write_op_time = Some(prepare_timestamp);
                Ok(Prepared {
                    prepare_timestamp,
                    touched: record.touched.clone(),
                    newly_prepared: true,
                })
            }
            (TxnState::Prepared | TxnState::Committed, Some(prepare_timestamp)) => Ok(Prepared {
                prepare_timestamp,
                touched: record.touched.clone(),
                newly_prepared: false,
            }),
            _ => Err(ParticipantError::NoSuchTransaction(*key)),
        }
    }

    /// Commit a prepared transaction at `commit_timestamp`
    pub fn commit(
        &mut self,
        key: &TransactionKey,
        commit_timestamp: HlcTimestamp,
    ) -> Result<CommitOutcome> {
        let Some(record) = self.sessions.get_mut(&key.session_id) else {
            return Err(ParticipantError::NoSuchTransaction(*key));
        };

        if key.txn_number < record.last_txn_number {
            return match record.resolved(key.txn_number) {
                Some(ResolvedTransaction::Committed { .. }) => Ok(CommitOutcome::AlreadyCommitted),
                _ => Err(ParticipantError::NoSuchTransaction(*key)),
            };
        }
        if key.txn_number > record.last_txn_number {
            return Err(ParticipantError::NoSuchTransaction(*key));
        }

        match record.txn_state {
            TxnState::Prepared => {
                record.txn_state = TxnState::Committed;
                record.commit_timestamp = Some(commit_timestamp);
                record.last_write_op_time = Some(commit_timestamp);
                Ok(CommitOutcome::Applied)
            }
            TxnState::Committed => Ok(CommitOutcome::AlreadyCommitted),
            TxnState::InProgress => Err(ParticipantError::NotPrepared(*key)),
            TxnState::Aborted => Err(ParticipantError::NoSuchTransaction(*key)),
        }
    }

    /// Abort the transaction if it is still open.
    ///
    /// An abort for a txnNumber the session has not reached yet fences that
    /// number: the session advances to it in the aborted state so a late
    /// statement for it cannot start it.
    pub fn abort(&mut self, key: &TransactionKey) -> Result<AbortOutcome> {
        let Some(record) = self.sessions.get_mut(&key.session_id) else {
            self.sessions.insert(
                key.session_id,
                SessionRecord::new(key.txn_number, TxnState::Aborted),
            );
            return Ok(AbortOutcome::NoOp);
        };

        if key.txn_number < record.last_txn_number {
            return match record.resolved(key.txn_number) {
                Some(ResolvedTransaction::Committed { .. }) => {
                    Err(ParticipantError::TransactionCommitted(*key))
                }
                _ => Ok(AbortOutcome::NoOp),
            };
        }

        if key.txn_number > record.last_txn_number {
            let current = TransactionKey::new(key.session_id, record.last_txn_number);
            return match record.txn_state {
                // Bound to its own coordinator's decision
                TxnState::Prepared => Ok(AbortOutcome::NoOp),
                TxnState::InProgress => {
                    record.advance(key.txn_number, TxnState::Aborted, self.history_limit);
                    Ok(AbortOutcome::Aborted(current))
                }
                TxnState::Committed | TxnState::Aborted => {
                    record.advance(key.txn_number, TxnState::Aborted, self.history_limit);
                    Ok(AbortOutcome::NoOp)
                }
            };
        }

        match record.txn_state {
            TxnState::InProgress | TxnState::Prepared => {
                record.txn_state = TxnState::Aborted;
                Ok(AbortOutcome::Aborted(*key))
            }
            TxnState::Aborted => Ok(AbortOutcome::NoOp),
            TxnState::Committed => Err(ParticipantError::TransactionCommitted(*key)),
        }
    }

    /// Answer a recovery query for `key`.
    ///
    /// Never waits on an undecided transaction. A newer txnNumber supersedes
    /// the tracked transaction unless it is prepared; the key of a transaction
    /// aborted this way is returned alongside the status.
    pub fn recovery_status(
        &mut self,
        key: &TransactionKey,
    ) -> Result<(LocalTransactionStatus, Option<TransactionKey>)> {
        let Some(record) = self.sessions.get_mut(&key.session_id) else {
            return Ok((LocalTransactionStatus::Unknown, None));
        };

        if key.txn_number < record.last_txn_number {
            return Err(Self::too_old(key, record));
        }

        if key.txn_number > record.last_txn_number {
            let current = TransactionKey::new(key.session_id, record.last_txn_number);
            let aborted = match record.txn_state {
                TxnState::Prepared => return Ok((LocalTransactionStatus::Superseded, None)),
                TxnState::InProgress => Some(current),
                TxnState::Committed | TxnState::Aborted => None,
            };
            record.advance(key.txn_number, TxnState::Aborted, self.history_limit);
            return Ok((LocalTransactionStatus::Superseded, aborted));
        }

        Ok((Self::local_status(record), None))
    }

    /// Read-only view of what the session knows about `key`
    pub fn status(&self, key: &TransactionKey) -> LocalTransactionStatus {
        let Some(record) = self.sessions.get(&key.session_id) else {
            return LocalTransactionStatus::Unknown;
        };

        if key.txn_number == record.last_txn_number {
            return Self::local_status(record);
        }
        if key.txn_number > record.last_txn_number {
            return LocalTransactionStatus::Unknown;
        }
        match record.resolved(key.txn_number) {
            Some(ResolvedTransaction::Committed {
                commit_timestamp, ..
            }) => LocalTransactionStatus::Committed(commit_timestamp),
            Some(ResolvedTransaction::Aborted) => LocalTransactionStatus::Aborted,
            None => LocalTransactionStatus::Superseded,
        }
    }

    fn local_status(record: &SessionRecord) -> LocalTransactionStatus {
        match (record.txn_state, record.commit_timestamp) {
            (TxnState::InProgress, _) => LocalTransactionStatus::InProgress,
            (TxnState::Prepared, _) => LocalTransactionStatus::Prepared,
            (TxnState::Committed, Some(commit_timestamp)) => {
                LocalTransactionStatus::Committed(commit_timestamp)
            }
            (TxnState::Committed, None) | (TxnState::Aborted, _) => LocalTransactionStatus::Aborted,
        }
    }
}
