//! Read-only views of coordinator activity

use crate::document::CoordinatorState;
use proven_common::{ParticipantId, TransactionKey};
use proven_protocol::CommitDecision;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// States a coordinator can be counted in, in protocol order
const COUNTED_STEPS: [CoordinatorState; 7] = [
    CoordinatorState::WritingParticipantList,
    CoordinatorState::SendingPrepare,
    CoordinatorState::WaitingForVotes,
    CoordinatorState::WritingDecision,
    CoordinatorState::SendingDecision,
    CoordinatorState::WaitingForDecisionAcks,
    CoordinatorState::DeletingDocument,
];

fn step_slot(state: CoordinatorState) -> Option<usize> {
    COUNTED_STEPS.iter().position(|step| *step == state)
}

/// Process-wide coordinator counters
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    total_created: AtomicU64,
    total_started_two_phase_commit: AtomicU64,
    total_committed_two_phase_commit: AtomicU64,
    total_aborted_two_phase_commit: AtomicU64,
    current_in_steps: [AtomicI64; 7],
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create(&self) {
        self.total_created.fetch_add(1, Ordering::Relaxed);
    }

    /// A coordinator moved from `previous` to `state`
    pub fn on_start_step(&self, state: CoordinatorState, previous: CoordinatorState) {
        if previous == CoordinatorState::Init {
            self.total_started_two_phase_commit
                .fetch_add(1, Ordering::Relaxed);
        }
        if let Some(slot) = step_slot(previous) {
            self.current_in_steps[slot].fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(slot) = step_slot(state) {
            self.current_in_steps[slot].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A coordinator exited while in `last`, with `decision` if it reached one
    pub fn on_end(&self, last: CoordinatorState, decision: Option<&CommitDecision>) {
        if let Some(slot) = step_slot(last) {
            self.current_in_steps[slot].fetch_sub(1, Ordering::Relaxed);
        }
        match decision {
            Some(CommitDecision::Commit { .. }) => {
                self.total_committed_two_phase_commit
                    .fetch_add(1, Ordering::Relaxed);
            }
            Some(CommitDecision::Abort { .. }) => {
                self.total_aborted_two_phase_commit
                    .fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }
    }

    pub fn total_created(&self) -> u64 {
        self.total_created.load(Ordering::Relaxed)
    }

    pub fn total_started_two_phase_commit(&self) -> u64 {
        self.total_started_two_phase_commit.load(Ordering::Relaxed)
    }

    pub fn total_committed_two_phase_commit(&self) -> u64 {
        self.total_committed_two_phase_commit.load(Ordering::Relaxed)
    }

    pub fn total_aborted_two_phase_commit(&self) -> u64 {
        self.total_aborted_two_phase_commit.load(Ordering::Relaxed)
    }

    /// Coordinators currently in `state`; always zero for states that are
    /// not counted
    pub fn current_in_step(&self, state: CoordinatorState) -> i64 {
        step_slot(state)
            .map(|slot| self.current_in_steps[slot].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_created: self.total_created(),
            total_started_two_phase_commit: self.total_started_two_phase_commit(),
            total_committed_two_phase_commit: self.total_committed_two_phase_commit(),
            total_aborted_two_phase_commit: self.total_aborted_two_phase_commit(),
            current_in_steps: COUNTED_STEPS
                .iter()
                .map(|step| (step.as_str(), self.current_in_step(*step)))
                .collect(),
        }
    }
}

/// Point-in-time copy of `CoordinatorMetrics`, keyed by step name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_created: u64,
    pub total_started_two_phase_commit: u64,
    pub total_committed_two_phase_commit: u64,
    pub total_aborted_two_phase_commit: u64,
    pub current_in_steps: BTreeMap<&'static str, i64>,
}

/// Snapshot of one live coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorReport {
    pub key: TransactionKey,
    pub participants: Vec<ParticipantId>,
    pub state: CoordinatorState,
    pub elapsed: Duration,
}

impl fmt::Display for CoordinatorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let participants: Vec<&str> = self.participants.iter().map(|p| p.as_str()).collect();
        write!(
            f,
            "{} [{}] {} for {:?}",
            self.key,
            participants.join(","),
            self.state,
            self.elapsed
        )
    }
}

/// Time spent in each coordinator state
#[derive(Debug, Default)]
pub struct StepTimings {
    current: Option<(CoordinatorState, Instant)>,
    completed: Vec<(CoordinatorState, Duration)>,
}

impl StepTimings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the running step and open `state`
    pub fn enter(&mut self, state: CoordinatorState) {
        let now = Instant::now();
        if let Some((previous, since)) = self.current.replace((state, now)) {
            self.completed.push((previous, now - since));
        }
    }

    /// Close the running step and return every recorded step
    pub fn finish(&mut self) -> Vec<(CoordinatorState, Duration)> {
        if let Some((previous, since)) = self.current.take() {
            self.completed.push((previous, since.elapsed()));
        }
        self.completed.clone()
    }
}

/// Render step timings as `state=duration` pairs
pub fn format_timings(timings: &[(CoordinatorState, Duration)]) -> String {
    timings
        .iter()
        .map(|(state, duration)| format!("{}={:?}", state, duration))
        .collect::<Vec<_>>()
        .join(" ")
}
