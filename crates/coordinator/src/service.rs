//! Request entry points of the commit coordinator
//!
//! `coordinate_commit` and `abort_transaction` route a request to the live
//! coordinator for its key, resume one from a persisted document, start a
//! fresh one, or fall back to recovery, in that order.

use crate::catalog::CoordinatorCatalog;
use crate::config::CoordinatorConfig;
use crate::coordinator::{CoordinationStart, CoordinatorContext, TransactionCoordinator};
use crate::diagnostics::{CoordinatorReport, MetricsSnapshot};
use crate::error::{CoordinatorError, Result};
use crate::recovery::RecoveryService;
use crate::store::DocumentStore;
use proven_common::{ParticipantId, TransactionKey};
use proven_protocol::{AbortReason, CommitDecision, ParticipantClient, SessionQuery};
use std::sync::Arc;

pub struct CoordinatorService {
    catalog: Arc<CoordinatorCatalog>,
    context: CoordinatorContext,
    recovery: RecoveryService,
}

impl CoordinatorService {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn DocumentStore>,
        client: Arc<dyn ParticipantClient>,
    ) -> Self {
        let catalog = Arc::new(CoordinatorCatalog::new());
        let metrics = catalog.metrics().clone();
        Self {
            catalog,
            context: CoordinatorContext {
                config: Arc::new(config),
                store,
                client,
                metrics,
            },
            recovery: RecoveryService::new(),
        }
    }

    /// Answer recovery queries from the participant co-located with this
    /// coordinator
    pub fn with_local_participant(mut self, id: ParticipantId, query: Arc<dyn SessionQuery>) -> Self {
        self.recovery = RecoveryService::with_local_participant(id, query);
        self
    }

    pub fn catalog(&self) -> &Arc<CoordinatorCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.context.config
    }

    /// Take over coordination in `epoch` and resume every persisted document.
    ///
    /// Returns how many coordinators were resumed.
    pub fn step_up(&self, epoch: u64) -> Result<usize> {
        self.catalog.step_up(epoch)?;

        let documents = self.context.store.list()?;
        let mut resumed = 0;
        for document in documents {
            let key = document.id;
            if let Err(e) = self.catalog.observe_txn_number(&key) {
                tracing::warn!("Not resuming {}: {}", key, e);
                continue;
            }
            let (_, started) = self.start(key, CoordinationStart::Resume(document))?;
            if started {
                resumed += 1;
            }
        }

        tracing::info!("Stepped up in epoch {}, resumed {} coordinators", epoch, resumed);
        Ok(resumed)
    }

    /// Give up coordination and wait for every live coordinator to exit.
    ///
    /// Documents stay in the store for the next tenure.
    pub async fn step_down(&self) {
        let live = self.catalog.step_down();
        futures::future::join_all(live.iter().map(|c| c.wait_finished())).await;
    }

    /// Drive `key` to a durable decision and return it.
    ///
    /// `participants` is the recovery token: with it a key unknown to this
    /// node is coordinated from scratch, without it the local participant's
    /// session state is the only source of truth.
    pub async fn coordinate_commit(
        &self,
        key: TransactionKey,
        participants: Option<Vec<ParticipantId>>,
    ) -> Result<CommitDecision> {
        self.catalog.observe_txn_number(&key)?;

        if let Some(coordinator) = self.catalog.get(&key) {
            tracing::debug!("Joining live coordinator for {}", key);
            return coordinator.wait_for_decision().await;
        }

        if let Some(document) = self.context.store.get(&key)? {
            let (coordinator, _) = self.start(key, CoordinationStart::Resume(document))?;
            return coordinator.wait_for_decision().await;
        }

        match participants {
            Some(participants) if participants.is_empty() => {
                Err(CoordinatorError::EmptyParticipantList(key))
            }
            Some(participants) => {
                let (coordinator, _) = self.start(key, CoordinationStart::Fresh(participants))?;
                coordinator.wait_for_decision().await
            }
            None => self.recovery.resolve(&key).await,
        }
    }

    /// Abort `key`, unless its coordinator already decided otherwise.
    ///
    /// Returns the decision that holds for the key.
    pub async fn abort_transaction(&self, key: TransactionKey) -> Result<CommitDecision> {
        self.catalog.observe_txn_number(&key)?;

        if let Some(coordinator) = self.catalog.get(&key) {
            return coordinator.wait_for_decision().await;
        }

        if let Some(document) = self.context.store.get(&key)? {
            let (coordinator, _) = self.start(key, CoordinationStart::Resume(document))?;
            return coordinator.wait_for_decision().await;
        }

        let Some(participant) = self.recovery.local_participant() else {
            return Err(CoordinatorError::NoSuchTransaction(key));
        };
        self.context.client.abort(participant, &key).await?;
        tracing::info!("Aborted {} on local participant {}", key, participant);
        Ok(CommitDecision::Abort {
            reason: AbortReason::Requested,
        })
    }

    pub fn report(&self) -> Vec<CoordinatorReport> {
        self.catalog.report()
    }

    /// Process-wide coordinator counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.catalog.metrics().snapshot()
    }

    /// Wait for every live coordinator to finish
    pub async fn join_all(&self) {
        self.catalog.join_all().await;
    }

    /// Register a coordinator for `key` unless one is live; spawn it if new.
    ///
    /// Returns the live coordinator and whether this call started it.
    fn start(
        &self,
        key: TransactionKey,
        start: CoordinationStart,
    ) -> Result<(Arc<TransactionCoordinator>, bool)> {
        let context = self.context.clone();
        let (coordinator, driver) = self.catalog.get_or_insert_with(key, |cancel, epoch| {
            TransactionCoordinator::new(key, epoch, cancel, context, start)
        })?;

        let Some(driver) = driver else {
            return Ok((coordinator, false));
        };

        let catalog = Arc::downgrade(&self.catalog);
        let handle = Arc::downgrade(&coordinator);
        driver
            .on_finish(move || {
                if let Some(catalog) = catalog.upgrade() {
                    catalog.remove_finished(&key, &handle);
                }
            })
            .spawn();
        Ok((coordinator, true))
    }
}

