//! Registry of live coordinators
//!
//! At most one coordinator exists per transaction key. The catalog also
//! remembers the highest txnNumber seen per session so requests for older
//! transactions are rejected, and it tracks the epoch in which this node is
//! allowed to coordinate.

use crate::coordinator::TransactionCoordinator;
use crate::diagnostics::{CoordinatorMetrics, CoordinatorReport};
use crate::error::{CoordinatorError, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use proven_common::{SessionId, TransactionKey, TxnNumber};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Tenure {
    epoch: u64,
    /// Present while stepped up; parent of every coordinator's token
    token: Option<CancellationToken>,
}

#[derive(Default)]
pub struct CoordinatorCatalog {
    coordinators: DashMap<TransactionKey, Arc<TransactionCoordinator>>,
    high_water: DashMap<SessionId, TxnNumber>,
    tenure: RwLock<Tenure>,
    metrics: Arc<CoordinatorMetrics>,
}

impl CoordinatorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting coordinators for `epoch`, which must be newer than
    /// any previous one
    pub fn step_up(&self, epoch: u64) -> Result<()> {
        let mut tenure = self.tenure.write();
        if epoch <= tenure.epoch {
            return Err(CoordinatorError::StaleEpoch {
                requested: epoch,
                current: tenure.epoch,
            });
        }
        if let Some(previous) = tenure.token.take() {
            previous.cancel();
        }
        tenure.epoch = epoch;
        tenure.token = Some(CancellationToken::new());
        tracing::info!("Coordinator catalog stepped up in epoch {}", epoch);
        Ok(())
    }

    /// Stop accepting coordinators and cancel every live one.
    ///
    /// Returns the coordinators that were live so callers can wait for them.
    pub fn step_down(&self) -> Vec<Arc<TransactionCoordinator>> {
        let token = self.tenure.write().token.take();
        if let Some(token) = token {
            token.cancel();
        }

        let live: Vec<_> = self
            .coordinators
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.coordinators.clear();
        tracing::info!(
            "Coordinator catalog stepped down, interrupted {} coordinators",
            live.len()
        );
        live
    }

    /// Counters shared by every coordinator started through this catalog
    pub fn metrics(&self) -> &Arc<CoordinatorMetrics> {
        &self.metrics
    }

    pub fn epoch(&self) -> u64 {
        self.tenure.read().epoch
    }

    pub fn is_active(&self) -> bool {
        self.tenure.read().token.is_some()
    }

    /// Record `key`'s txnNumber, rejecting it if the session has moved on
    pub fn observe_txn_number(&self, key: &TransactionKey) -> Result<()> {
        let mut entry = self.high_water.entry(key.session_id).or_insert(key.txn_number);
        if key.txn_number < *entry {
            return Err(CoordinatorError::TransactionTooOld {
                key: *key,
                active: *entry,
            });
        }
        *entry = key.txn_number;
        Ok(())
    }

    pub fn get(&self, key: &TransactionKey) -> Option<Arc<TransactionCoordinator>> {
        self.coordinators.get(key).map(|entry| entry.value().clone())
    }

    /// Return the live coordinator for `key`, or insert the one built by
    /// `make`.
    ///
    /// `make` receives a cancellation token scoped to the current epoch and
    /// runs at most once, while the key's entry is locked. Its second return
    /// value is handed back only when the new coordinator was inserted.
    pub fn get_or_insert_with<T>(
        &self,
        key: TransactionKey,
        make: impl FnOnce(CancellationToken, u64) -> (Arc<TransactionCoordinator>, T),
    ) -> Result<(Arc<TransactionCoordinator>, Option<T>)> {
        let (token, epoch) = {
            let tenure = self.tenure.read();
            match &tenure.token {
                Some(token) => (token.child_token(), tenure.epoch),
                None => return Err(CoordinatorError::SteppingDown),
            }
        };

        match self.coordinators.entry(key) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), None)),
            Entry::Vacant(entry) => {
                let (coordinator, extra) = make(token, epoch);
                entry.insert(coordinator.clone());
                Ok((coordinator, Some(extra)))
            }
        }
    }

    /// Drop `key` if it still maps to `coordinator`
    pub fn remove_finished(&self, key: &TransactionKey, coordinator: &Weak<TransactionCoordinator>) {
        self.coordinators.remove_if(key, |_, live| {
            std::ptr::eq(Arc::as_ptr(live), coordinator.as_ptr())
        });
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }

    /// Snapshot of every live coordinator, ordered by key
    pub fn report(&self) -> Vec<CoordinatorReport> {
        let mut reports: Vec<_> = self
            .coordinators
            .iter()
            .map(|entry| entry.value().report())
            .collect();
        reports.sort_by_key(|report| report.key);
        reports
    }

    /// Wait until every coordinator live at the time of the call finishes
    pub async fn join_all(&self) {
        let live: Vec<_> = self
            .coordinators
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        futures::future::join_all(live.iter().map(|c| c.wait_finished())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::coordinator::{CoordinationStart, CoordinatorContext};
    use crate::store::MemoryDocumentStore;
    use proven_common::ParticipantId;
    use proven_engine::MockNetwork;

    fn context() -> CoordinatorContext {
        CoordinatorContext {
            config: Arc::new(CoordinatorConfig::default()),
            store: Arc::new(MemoryDocumentStore::new()),
            client: Arc::new(MockNetwork::new()),
            metrics: Arc::new(CoordinatorMetrics::new()),
        }
    }

    fn make(
        key: TransactionKey,
    ) -> impl FnOnce(CancellationToken, u64) -> (Arc<TransactionCoordinator>, ()) {
        move |token, epoch| {
            let (handle, _driver) = TransactionCoordinator::new(
                key,
                epoch,
                token,
                context(),
                CoordinationStart::Fresh(vec![ParticipantId::new("a")]),
            );
            (handle, ())
        }
    }

    #[test]
    fn test_epochs_must_increase() {
        let catalog = CoordinatorCatalog::new();
        assert!(!catalog.is_active());
        catalog.step_up(2).unwrap();
        assert!(catalog.is_active());
        assert!(matches!(
            catalog.step_up(2),
            Err(CoordinatorError::StaleEpoch {
                requested: 2,
                current: 2
            })
        ));
        catalog.step_down();
        assert!(matches!(
            catalog.step_up(1),
            Err(CoordinatorError::StaleEpoch { .. })
        ));
        catalog.step_up(3).unwrap();
        assert_eq!(catalog.epoch(), 3);
    }

    #[test]
    fn test_older_txn_numbers_are_rejected() {
        let catalog = CoordinatorCatalog::new();
        let session = SessionId::new();

        catalog
            .observe_txn_number(&TransactionKey::new(session, 5))
            .unwrap();
        catalog
            .observe_txn_number(&TransactionKey::new(session, 5))
            .unwrap();
        assert!(matches!(
            catalog.observe_txn_number(&TransactionKey::new(session, 4)),
            Err(CoordinatorError::TransactionTooOld { .. })
        ));
        catalog
            .observe_txn_number(&TransactionKey::new(session, 6))
            .unwrap();
        catalog
            .observe_txn_number(&TransactionKey::new(SessionId::new(), 1))
            .unwrap();
    }

    #[test]
    fn test_one_coordinator_per_key() {
        let catalog = CoordinatorCatalog::new();
        let key = TransactionKey::new(SessionId::new(), 1);
        assert!(matches!(
            catalog.get_or_insert_with(key, make(key)),
            Err(CoordinatorError::SteppingDown)
        ));

        catalog.step_up(1).unwrap();
        let (first, inserted) = catalog.get_or_insert_with(key, make(key)).unwrap();
        assert!(inserted.is_some());
        let (second, inserted) = catalog.get_or_insert_with(key, make(key)).unwrap();
        assert!(inserted.is_none());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(catalog.report().len(), 1);

        // A handle that was never registered does not evict the live one
        let (other, _) = make(key)(CancellationToken::new(), 1);
        catalog.remove_finished(&key, &Arc::downgrade(&other));
        assert!(catalog.get(&key).is_some());

        catalog.remove_finished(&key, &Arc::downgrade(&first));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_step_down_cancels_children() {
        let catalog = CoordinatorCatalog::new();
        catalog.step_up(1).unwrap();
        let key = TransactionKey::new(SessionId::new(), 1);
        let (coordinator, _) = catalog.get_or_insert_with(key, make(key)).unwrap();

        let live = catalog.step_down();
        assert_eq!(live.len(), 1);
        assert!(catalog.is_empty());
        assert!(!catalog.is_active());
        assert!(catalog.get(&key).is_none());
        assert!(coordinator.is_cancelled());
    }
}
