//! In-memory document store for testing

use super::{DocumentStore, StoreError, StoreResult};
use crate::document::{CoordinatorDocument, DocumentDecision};
use parking_lot::Mutex;
use proven_common::{ParticipantId, TransactionKey};
use std::collections::BTreeMap;

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<TransactionKey, CoordinatorDocument>,
    /// Remaining writes to reject with `NotWritable`
    failing_writes: usize,
    read_only: bool,
    /// Every decision that reached the store, in write order
    decision_log: Vec<(TransactionKey, DocumentDecision)>,
}

impl MemoryState {
    fn check_writable(&mut self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::NotWritable);
        }
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StoreError::NotWritable);
        }
        Ok(())
    }
}

/// Document store kept in process memory
#[derive(Default)]
pub struct MemoryDocumentStore {
    state: Mutex<MemoryState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` writes as not writable
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    /// Reject every write until cleared
    pub fn set_read_only(&self, read_only: bool) {
        self.state.lock().read_only = read_only;
    }

    /// Decisions written so far, including ones for deleted documents
    pub fn decision_log(&self) -> Vec<(TransactionKey, DocumentDecision)> {
        self.state.lock().decision_log.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn create_or_get(&self, document: CoordinatorDocument) -> StoreResult<CoordinatorDocument> {
        let mut state = self.state.lock();
        if let Some(existing) = state.documents.get(&document.id) {
            return Ok(existing.clone());
        }
        state.check_writable()?;
        state.documents.insert(document.id, document.clone());
        Ok(document)
    }

    fn get(&self, key: &TransactionKey) -> StoreResult<Option<CoordinatorDocument>> {
        Ok(self.state.lock().documents.get(key).cloned())
    }

    fn add_participants(
        &self,
        key: &TransactionKey,
        participants: &[ParticipantId],
        finalize: bool,
    ) -> StoreResult<CoordinatorDocument> {
        let mut state = self.state.lock();
        state.check_writable()?;
        let document = state
            .documents
            .get_mut(key)
            .ok_or(StoreError::NotFound(*key))?;
        document.add_participants(participants, finalize)?;
        Ok(document.clone())
    }

    fn persist_decision(
        &self,
        key: &TransactionKey,
        decision: DocumentDecision,
        late_participants: &[ParticipantId],
    ) -> StoreResult<DocumentDecision> {
        let mut state = self.state.lock();
        state.check_writable()?;
        let document = state
            .documents
            .get_mut(key)
            .ok_or(StoreError::NotFound(*key))?;

        let was_pending = document.decision.is_pending();
        let stored = document.decide(decision, late_participants);
        if was_pending {
            state.decision_log.push((*key, stored.clone()));
        }
        Ok(stored)
    }

    fn delete(&self, key: &TransactionKey) -> StoreResult<()> {
        let mut state = self.state.lock();
        let pending = match state.documents.get(key) {
            None => return Ok(()),
            Some(document) => document.decision.is_pending(),
        };
        if pending {
            return Err(StoreError::DecisionPending(*key));
        }
        state.check_writable()?;
        state.documents.remove(key);
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<CoordinatorDocument>> {
        Ok(self.state.lock().documents.values().cloned().collect())
    }
}
