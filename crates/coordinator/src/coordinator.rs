//! Commit coordination for one transaction key
//!
//! A `TransactionCoordinator` is the shared handle callers wait on; the
//! protocol itself runs in a spawned `CoordinatorDriver` task that owns the
//! sending half of the progress channel.
//!
//! The driver persists the participant list, collects votes, writes the
//! decision, delivers it and finally deletes the document. Everything before
//! the decision write can be abandoned and redone by a successor; everything
//! after it only re-sends a decision that can no longer change.

use crate::config::{CoordinatorConfig, ParticipantListPolicy};
use crate::diagnostics::{CoordinatorMetrics, CoordinatorReport, StepTimings, format_timings};
use crate::document::{CoordinatorDocument, CoordinatorState};
use crate::error::{CoordinatorError, Result};
use crate::retry::{RetryError, with_retry};
use crate::store::{DocumentStore, StoreError, StoreResult};
use futures::future::join_all;
use parking_lot::Mutex;
use proven_common::{ParticipantId, Timestamp, TransactionKey};
use proven_protocol::{
    AbortReason, CommitDecision, ParticipantClient, ParticipantError, ParticipantSignal,
    ParticipantVote, VoteOutcome,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared dependencies of every coordinator on this process
#[derive(Clone)]
pub struct CoordinatorContext {
    pub config: Arc<CoordinatorConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub client: Arc<dyn ParticipantClient>,
    pub metrics: Arc<CoordinatorMetrics>,
}

/// How a coordinator begins
#[derive(Debug, Clone)]
pub enum CoordinationStart {
    /// First request for the key, with the caller's participant list
    Fresh(Vec<ParticipantId>),
    /// Continue from a persisted document
    Resume(CoordinatorDocument),
}

/// Published view of a running coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorProgress {
    pub state: CoordinatorState,
    pub participants: Vec<ParticipantId>,
    pub decision: Option<CommitDecision>,
    /// Why the coordinator stopped before finishing, if it did
    pub stopped: Option<String>,
    pub finished: bool,
    /// Per-state durations, filled in when the coordinator finishes
    pub step_timings: Vec<(CoordinatorState, Duration)>,
}

impl CoordinatorProgress {
    fn new(participants: Vec<ParticipantId>) -> Self {
        Self {
            state: CoordinatorState::Init,
            participants,
            decision: None,
            stopped: None,
            finished: false,
            step_timings: Vec::new(),
        }
    }
}

/// Handle to the coordinator of one transaction key
pub struct TransactionCoordinator {
    key: TransactionKey,
    epoch: u64,
    started: Instant,
    cancel: CancellationToken,
    progress: watch::Receiver<CoordinatorProgress>,
}

impl TransactionCoordinator {
    /// Build a handle and the driver that will run the protocol.
    ///
    /// Nothing runs until the driver is spawned.
    pub fn new(
        key: TransactionKey,
        epoch: u64,
        cancel: CancellationToken,
        context: CoordinatorContext,
        start: CoordinationStart,
    ) -> (Arc<Self>, CoordinatorDriver) {
        let participants = match &start {
            CoordinationStart::Fresh(participants) => participants.clone(),
            CoordinationStart::Resume(document) => document.participants.clone(),
        };
        let (progress_tx, progress_rx) = watch::channel(CoordinatorProgress::new(participants));
        context.metrics.on_create();

        let handle = Arc::new(Self {
            key,
            epoch,
            started: Instant::now(),
            cancel: cancel.clone(),
            progress: progress_rx,
        });

        let driver = CoordinatorDriver {
            key,
            context,
            cancel,
            start: Some(start),
            progress: progress_tx,
            timings: Mutex::new(StepTimings::new()),
            on_finish: None,
        };

        (handle, driver)
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Catalog epoch this coordinator was started in
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> CoordinatorState {
        self.progress.borrow().state
    }

    pub fn decision(&self) -> Option<CommitDecision> {
        self.progress.borrow().decision.clone()
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        self.progress.borrow().participants.clone()
    }

    pub fn progress(&self) -> CoordinatorProgress {
        self.progress.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.progress.borrow().finished
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Interrupt outstanding work. A decision already written stays written.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the decision is durable
    pub async fn wait_for_decision(&self) -> Result<CommitDecision> {
        let mut progress = self.progress.clone();
        let snapshot = match progress
            .wait_for(|p| p.decision.is_some() || p.finished)
            .await
        {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.progress.borrow().clone(),
        };

        match snapshot.decision {
            Some(decision) => Ok(decision),
            None if self.cancel.is_cancelled() => Err(CoordinatorError::SteppingDown),
            None => Err(CoordinatorError::Abandoned {
                key: self.key,
                reason: snapshot
                    .stopped
                    .unwrap_or_else(|| "coordinator exited".to_string()),
            }),
        }
    }

    /// Wait until the driver task has exited
    pub async fn wait_finished(&self) {
        let mut progress = self.progress.clone();
        let _ = progress.wait_for(|p| p.finished).await;
    }

    pub fn report(&self) -> CoordinatorReport {
        let progress = self.progress.borrow();
        CoordinatorReport {
            key: self.key,
            participants: progress.participants.clone(),
            state: progress.state,
            elapsed: self.elapsed(),
        }
    }
}

/// Why the driver stopped early
enum Stop {
    Cancelled,
    Failed(String),
}

/// Runs the commit protocol for one key
pub struct CoordinatorDriver {
    key: TransactionKey,
    context: CoordinatorContext,
    cancel: CancellationToken,
    start: Option<CoordinationStart>,
    progress: watch::Sender<CoordinatorProgress>,
    timings: Mutex<StepTimings>,
    on_finish: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CoordinatorDriver {
    /// Run `callback` after the driver has published its final progress
    pub fn on_finish(mut self, callback: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Box::new(callback));
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let outcome = self.drive().await;
        let step_timings = self.timings.lock().finish();
        let (last_state, decision) = {
            let progress = self.progress.borrow();
            (progress.state, progress.decision.clone())
        };
        self.context.metrics.on_end(last_state, decision.as_ref());
        let decided = decision.is_some();

        let stopped = match outcome {
            Ok(()) => {
                tracing::info!(
                    "Coordinator for {} finished: {}",
                    self.key,
                    format_timings(&step_timings)
                );
                None
            }
            Err(Stop::Cancelled) => {
                tracing::info!(
                    "Coordinator for {} interrupted in {}",
                    self.key,
                    self.progress.borrow().state
                );
                Some("stepping down".to_string())
            }
            Err(Stop::Failed(reason)) => {
                tracing::error!("Coordinator for {} gave up: {}", self.key, reason);
                Some(reason)
            }
        };

        self.progress.send_modify(|p| {
            if stopped.is_some() && !decided {
                p.state = CoordinatorState::Aborted;
            }
            p.stopped = stopped;
            p.finished = true;
            p.step_timings = step_timings;
        });

        if let Some(callback) = self.on_finish.take() {
            callback();
        }
    }

    fn enter(&self, state: CoordinatorState) {
        self.timings.lock().enter(state);
        let mut previous = state;
        self.progress.send_modify(|p| previous = std::mem::replace(&mut p.state, state));
        self.context.metrics.on_start_step(state, previous);
        tracing::debug!("Coordinator for {} entered {}", self.key, state);
    }

    fn publish_participants(&self, participants: &[ParticipantId]) {
        self.progress
            .send_modify(|p| p.participants = participants.to_vec());
    }

    async fn drive(&mut self) -> std::result::Result<(), Stop> {
        let start = self
            .start
            .take()
            .ok_or_else(|| Stop::Failed("coordinator started twice".to_string()))?;

        let mut document = match start {
            CoordinationStart::Fresh(participants) => {
                self.enter(CoordinatorState::WritingParticipantList);
                let finalized = self.context.config.participant_list_policy
                    == ParticipantListPolicy::FinalizeOnWrite;
                let deadline = Timestamp::now().add(self.context.config.commit_deadline);
                let document =
                    CoordinatorDocument::new(self.key, participants, finalized, deadline);
                self.store_op(|store| store.create_or_get(document.clone()))
                    .await?
            }
            CoordinationStart::Resume(document) => {
                tracing::info!(
                    "Resuming coordination of {} from {}",
                    self.key,
                    document.state
                );
                document
            }
        };
        self.publish_participants(&document.participants);

        let decision = match document.decision.to_decision() {
            Some(decision) => decision,
            None => {
                let (decision, late) = self.collect_votes(&mut document).await?;
                self.enter(CoordinatorState::WritingDecision);
                let stored = self
                    .store_op(|store| {
                        store.persist_decision(&self.key, decision.clone().into(), &late)
                    })
                    .await?;
                document.decide(stored.clone(), &late);
                stored.to_decision().unwrap_or(decision)
            }
        };

        tracing::info!("Decision for {}: {}", self.key, decision);
        self.progress
            .send_modify(|p| p.decision = Some(decision.clone()));

        self.deliver_decision(&document.decision_recipients(), &decision)
            .await?;

        self.enter(CoordinatorState::DeletingDocument);
        if let Err(e) = self.context.store.delete(&self.key) {
            tracing::warn!("Failed to delete coordinator document for {}: {}", self.key, e);
        }

        self.enter(CoordinatorState::Done);
        Ok(())
    }

    /// Run prepare rounds until a decision can be derived from the votes.
    ///
    /// Also returns participants reported in the last round that never made
    /// it onto the list; an abort must reach them too.
    async fn collect_votes(
        &self,
        document: &mut CoordinatorDocument,
    ) -> std::result::Result<(CommitDecision, Vec<ParticipantId>), Stop> {
        let deadline = Instant::now() + document.deadline.remaining();
        let mut round = 1;

        loop {
            self.enter(CoordinatorState::SendingPrepare);
            let participants = document.participants.clone();
            let prepares = participants
                .iter()
                .map(|participant| self.prepare_one(participant, deadline));

            self.enter(CoordinatorState::WaitingForVotes);
            let mut votes = Vec::with_capacity(participants.len());
            let mut discovered = BTreeSet::new();
            for result in join_all(prepares).await {
                let (vote, signal) = result?;
                discovered.extend(signal.unknown_to(&participants));
                votes.push(vote);
            }

            if votes.iter().any(|vote| !vote.is_prepared()) || discovered.is_empty() {
                if !document.participants_finalized {
                    *document = self
                        .store_op(|store| store.add_participants(&self.key, &[], true))
                        .await?;
                }
                let late = discovered.into_iter().collect();
                return Ok((CommitDecision::from_votes(&votes), late));
            }

            let names: Vec<&str> = discovered.iter().map(|p| p.as_str()).collect();
            if document.participants_finalized
                || round >= self.context.config.max_prepare_rounds
            {
                tracing::warn!(
                    "Aborting {}: participants {} reported after the list was finalized",
                    self.key,
                    names.join(",")
                );
                let late = discovered.iter().cloned().collect();
                return Ok((
                    CommitDecision::Abort {
                        reason: AbortReason::ParticipantListChanged(discovered),
                    },
                    late,
                ));
            }

            tracing::info!(
                "Adding participants {} to {} and restarting prepare round {}",
                names.join(","),
                self.key,
                round
            );
            let added: Vec<ParticipantId> = discovered.into_iter().collect();
            *document = self
                .store_op(|store| store.add_participants(&self.key, &added, false))
                .await?;
            self.publish_participants(&document.participants);
            round += 1;
        }
    }

    async fn prepare_one(
        &self,
        participant: &ParticipantId,
        deadline: Instant,
    ) -> std::result::Result<(ParticipantVote, ParticipantSignal), Stop> {
        let client = &self.context.client;
        let result = with_retry(
            &self.context.config.retry,
            &self.cancel,
            Some(deadline),
            ParticipantError::is_retriable,
            || client.prepare(participant, &self.key),
        )
        .await;

        let (outcome, signal) = match result {
            Ok(response) => match response.prepare_timestamp {
                Some(timestamp) => (VoteOutcome::Prepared(timestamp), response.signal),
                None => (
                    VoteOutcome::VoteAbort(AbortReason::MissingPrepareTimestamp),
                    response.signal,
                ),
            },
            Err(RetryError::Cancelled) => return Err(Stop::Cancelled),
            Err(RetryError::DeadlineExceeded(last_error)) => {
                tracing::warn!(
                    "No vote from {} for {} before the deadline (last error: {:?})",
                    participant,
                    self.key,
                    last_error
                );
                (
                    VoteOutcome::VoteAbort(AbortReason::Timeout),
                    ParticipantSignal::Normal,
                )
            }
            Err(RetryError::Failed(error)) => (
                VoteOutcome::VoteAbort(vote_abort_reason(&error)),
                ParticipantSignal::Normal,
            ),
        };

        tracing::debug!("{} voted {:?} for {}", participant, outcome, self.key);
        Ok((
            ParticipantVote {
                participant: participant.clone(),
                outcome,
            },
            signal,
        ))
    }

    /// Send the fixed decision to every participant until each acknowledges
    async fn deliver_decision(
        &self,
        participants: &[ParticipantId],
        decision: &CommitDecision,
    ) -> std::result::Result<(), Stop> {
        self.enter(CoordinatorState::SendingDecision);
        let sends = participants
            .iter()
            .map(|participant| self.deliver_one(participant, decision));

        self.enter(CoordinatorState::WaitingForDecisionAcks);
        for result in join_all(sends).await {
            result?;
        }
        Ok(())
    }

    async fn deliver_one(
        &self,
        participant: &ParticipantId,
        decision: &CommitDecision,
    ) -> std::result::Result<(), Stop> {
        let client = &self.context.client;
        let result = with_retry(
            &self.context.config.retry,
            &self.cancel,
            None,
            ParticipantError::is_retriable,
            || async {
                match decision {
                    CommitDecision::Commit { commit_timestamp } => {
                        client
                            .commit(participant, &self.key, *commit_timestamp)
                            .await
                    }
                    CommitDecision::Abort { .. } => client.abort(participant, &self.key).await,
                }
            },
        )
        .await;

        match result {
            Ok(()) => {
                tracing::debug!("{} acknowledged {} for {}", participant, decision, self.key);
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(Stop::Cancelled),
            Err(RetryError::Failed(error)) if error.is_no_such_transaction() => {
                tracing::debug!(
                    "{} no longer knows {}, treating as acknowledged",
                    participant,
                    self.key
                );
                Ok(())
            }
            Err(RetryError::Failed(error)) => {
                tracing::warn!(
                    "{} rejected {} for {}: {}",
                    participant,
                    decision,
                    self.key,
                    error
                );
                Ok(())
            }
            Err(RetryError::DeadlineExceeded(_)) => Ok(()),
        }
    }

    /// Run a store operation, retrying transient failures until cancelled
    async fn store_op<T>(
        &self,
        op: impl Fn(&dyn DocumentStore) -> StoreResult<T>,
    ) -> std::result::Result<T, Stop> {
        let store = self.context.store.as_ref();
        let result = with_retry(
            &self.context.config.retry,
            &self.cancel,
            None,
            StoreError::is_retriable,
            || std::future::ready(op(store)),
        )
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(RetryError::Cancelled) => Err(Stop::Cancelled),
            Err(RetryError::Failed(error)) | Err(RetryError::DeadlineExceeded(Some(error))) => {
                Err(Stop::Failed(format!("store failure: {}", error)))
            }
            Err(RetryError::DeadlineExceeded(None)) => {
                Err(Stop::Failed("store operation timed out".to_string()))
            }
        }
    }
}

/// Map a non-retriable prepare failure to the vote it implies
fn vote_abort_reason(error: &ParticipantError) -> AbortReason {
    match error {
        ParticipantError::NoSuchTransaction(_) => AbortReason::NoSuchTransaction,
        ParticipantError::TransactionTooOld { .. } => AbortReason::TransactionTooOld,
        other => AbortReason::Refused(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::store::MemoryDocumentStore;
    use proven_common::{SessionId, StatementId};
    use proven_engine::MockNetwork;
    use proven_protocol::{LocalTransactionStatus, StatementRequest};
    use serde_json::json;

    fn context(network: Arc<MockNetwork>, store: Arc<MemoryDocumentStore>) -> CoordinatorContext {
        CoordinatorContext {
            config: Arc::new(
                CoordinatorConfig::default()
                    .with_commit_deadline(Duration::from_secs(5))
                    .with_retry(RetryConfig::default().with_max_backoff(Duration::from_millis(100))),
            ),
            store,
            client: network,
            metrics: Arc::new(CoordinatorMetrics::new()),
        }
    }

    fn shard(name: &str) -> ParticipantId {
        ParticipantId::new(name)
    }

    fn begin(network: &MockNetwork, key: TransactionKey, participants: &[&str]) {
        for name in participants {
            network
                .execute(
                    &shard(name),
                    &StatementRequest::start(key, StatementId(0), json!({"set": name})),
                )
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_runs_to_done() {
        let network = Arc::new(MockNetwork::with_participants(["a", "b"]).unwrap());
        let store = Arc::new(MemoryDocumentStore::new());
        let key = TransactionKey::new(SessionId::new(), 1);
        begin(&network, key, &["a", "b"]);

        let (handle, driver) = TransactionCoordinator::new(
            key,
            1,
            CancellationToken::new(),
            context(network.clone(), store.clone()),
            CoordinationStart::Fresh(vec![shard("a"), shard("b")]),
        );
        driver.spawn();

        let decision = handle.wait_for_decision().await.unwrap();
        assert!(decision.is_commit());
        handle.wait_finished().await;

        assert_eq!(handle.state(), CoordinatorState::Done);
        assert!(store.is_empty());
        let progress = handle.progress();
        assert!(progress.stopped.is_none());
        assert!(progress
            .step_timings
            .iter()
            .any(|(state, _)| *state == CoordinatorState::WritingDecision));
        for name in ["a", "b"] {
            let participant = network.participant(&shard(name)).unwrap();
            assert!(matches!(
                participant.status(&key),
                LocalTransactionStatus::Committed(_)
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_participant_times_out() {
        let network = Arc::new(MockNetwork::with_participants(["a", "b"]).unwrap());
        let store = Arc::new(MemoryDocumentStore::new());
        let key = TransactionKey::new(SessionId::new(), 1);
        begin(&network, key, &["a", "b"]);
        network.partition(&shard("b"));

        let (handle, driver) = TransactionCoordinator::new(
            key,
            1,
            CancellationToken::new(),
            context(network.clone(), store.clone()),
            CoordinationStart::Fresh(vec![shard("a"), shard("b")]),
        );
        driver.spawn();

        let decision = handle.wait_for_decision().await.unwrap();
        assert_eq!(
            decision,
            CommitDecision::Abort {
                reason: AbortReason::Timeout
            }
        );

        network.heal_all();
        handle.wait_finished().await;
        let a = network.participant(&shard("a")).unwrap();
        let b = network.participant(&shard("b")).unwrap();
        assert_eq!(a.status(&key), LocalTransactionStatus::Aborted);
        assert_eq!(b.status(&key), LocalTransactionStatus::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_decision_leaves_document() {
        let network = Arc::new(MockNetwork::with_participants(["a", "b"]).unwrap());
        let store = Arc::new(MemoryDocumentStore::new());
        let key = TransactionKey::new(SessionId::new(), 1);
        begin(&network, key, &["a", "b"]);
        network.partition(&shard("b"));

        let cancel = CancellationToken::new();
        let (handle, driver) = TransactionCoordinator::new(
            key,
            1,
            cancel.clone(),
            context(network.clone(), store.clone()),
            CoordinationStart::Fresh(vec![shard("a"), shard("b")]),
        );
        driver.spawn();

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel();

        assert!(matches!(
            handle.wait_for_decision().await,
            Err(CoordinatorError::SteppingDown)
        ));
        handle.wait_finished().await;
        assert_eq!(handle.state(), CoordinatorState::Aborted);

        let document = store.get(&key).unwrap().unwrap();
        assert!(document.decision.is_pending());
        assert!(store.decision_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retriable_store_failure_abandons() {
        let network = Arc::new(MockNetwork::with_participants(["a"]).unwrap());
        let store = Arc::new(MemoryDocumentStore::new());
        let key = TransactionKey::new(SessionId::new(), 1);
        begin(&network, key, &["a"]);

        // Resuming a document that was never written fails with NotFound
        let document = CoordinatorDocument::new(
            key,
            [shard("a")],
            true,
            Timestamp::now().add(Duration::from_secs(5)),
        );
        let (handle, driver) = TransactionCoordinator::new(
            key,
            1,
            CancellationToken::new(),
            context(network.clone(), store.clone()),
            CoordinationStart::Resume(document),
        );
        driver.spawn();

        assert!(matches!(
            handle.wait_for_decision().await,
            Err(CoordinatorError::Abandoned { .. })
        ));
        assert_eq!(handle.state(), CoordinatorState::Aborted);
    }
}
