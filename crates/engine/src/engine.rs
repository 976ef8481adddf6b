//! Core mock network implementation
//!
//! Routes requests by participant id to in-process participants and applies
//! injected faults on the way.

use crate::message::{Delivery, DeliveryOutcome};
use crate::{EngineError, Result};
use parking_lot::Mutex;
use proven_common::ParticipantId;
use proven_participant::Participant;
use proven_protocol::{AddressedRequest, ParticipantError, TransactionPhase};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Faults injected for one participant
#[derive(Debug, Default)]
struct FaultState {
    /// Every request is dropped
    partitioned: bool,
    /// Requests of these phases are dropped
    dropped_phases: HashSet<TransactionPhase>,
    /// Errors returned, in order, instead of delivering the next requests
    scripted: VecDeque<ParticipantError>,
}

impl FaultState {
    fn is_clear(&self) -> bool {
        !self.partitioned && self.dropped_phases.is_empty() && self.scripted.is_empty()
    }
}

/// In-process network connecting a coordinator to its participants
pub struct MockNetwork {
    /// Registered participants
    participants: Mutex<HashMap<ParticipantId, Arc<Participant>>>,

    /// Injected faults per participant
    faults: Mutex<HashMap<ParticipantId, FaultState>>,

    /// Log of every control request seen
    deliveries: Mutex<Vec<Delivery>>,

    /// Delay applied before each delivery
    latency: Mutex<Option<Duration>>,
}

impl MockNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self {
            participants: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
        }
    }

    /// Attach a participant to the network
    pub fn register(&self, participant: Arc<Participant>) -> Result<()> {
        let mut participants = self.participants.lock();
        let id = participant.id().clone();
        if participants.contains_key(&id) {
            return Err(EngineError::DuplicateParticipant(id));
        }
        tracing::debug!("Registered participant {}", id);
        participants.insert(id, participant);
        Ok(())
    }

    /// Create and attach in-memory participants with the given ids
    pub fn with_participants<I, P>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<ParticipantId>,
    {
        let network = Self::new();
        for id in ids {
            network.register(Arc::new(Participant::in_memory(id)))?;
        }
        Ok(network)
    }

    /// Look up a registered participant
    pub fn participant(&self, id: &ParticipantId) -> Result<Arc<Participant>> {
        self.participants
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownParticipant(id.clone()))
    }

    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.participants.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    // === FAULT INJECTION ===

    /// Drop every request to a participant until healed
    pub fn partition(&self, id: &ParticipantId) {
        self.faults.lock().entry(id.clone()).or_default().partitioned = true;
    }

    /// Drop requests of one phase to a participant until healed
    pub fn drop_phase(&self, id: &ParticipantId, phase: TransactionPhase) {
        self.faults
            .lock()
            .entry(id.clone())
            .or_default()
            .dropped_phases
            .insert(phase);
    }

    /// Fail the next `count` requests to a participant with `error`
    pub fn fail_next(&self, id: &ParticipantId, count: usize, error: ParticipantError) {
        let mut faults = self.faults.lock();
        let state = faults.entry(id.clone()).or_default();
        state
            .scripted
            .extend(std::iter::repeat_n(error, count));
    }

    /// Remove every fault injected for a participant
    pub fn heal(&self, id: &ParticipantId) {
        self.faults.lock().remove(id);
    }

    pub fn heal_all(&self) {
        self.faults.lock().clear();
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    // === DELIVERY ===

    /// Apply latency and faults, then resolve the target participant
    pub(crate) async fn route(
        &self,
        request: &AddressedRequest,
    ) -> std::result::Result<Arc<Participant>, ParticipantError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.injected_fault(&request.participant, request.request.phase()) {
            tracing::debug!(
                "Dropped {} for {} to {}: {}",
                request.request.phase(),
                request.request.key(),
                request.participant,
                error
            );
            self.log(request.clone(), DeliveryOutcome::Dropped(error.clone()));
            return Err(error);
        }

        self.participant(&request.participant)
            .map_err(|_| ParticipantError::UnknownParticipant(request.participant.clone()))
    }

    fn injected_fault(
        &self,
        id: &ParticipantId,
        phase: TransactionPhase,
    ) -> Option<ParticipantError> {
        let mut faults = self.faults.lock();
        let state = faults.get_mut(id)?;

        let fault = if state.partitioned || state.dropped_phases.contains(&phase) {
            Some(ParticipantError::NetworkPartition(id.clone()))
        } else {
            state.scripted.pop_front()
        };

        if state.is_clear() {
            faults.remove(id);
        }
        fault
    }

    /// Record the result of a request the participant handled
    pub(crate) fn record<T>(
        &self,
        request: AddressedRequest,
        result: &std::result::Result<T, ParticipantError>,
    ) {
        let outcome = match result {
            Ok(_) => DeliveryOutcome::Acknowledged,
            Err(error) => DeliveryOutcome::Rejected(error.clone()),
        };
        self.log(request, outcome);
    }

    fn log(&self, request: AddressedRequest, outcome: DeliveryOutcome) {
        self.deliveries.lock().push(Delivery { request, outcome });
    }

    /// Every logged request, in order
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    /// Logged requests that reached `id` with the given phase
    pub fn delivered(&self, id: &ParticipantId, phase: TransactionPhase) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .iter()
            .filter(|d| d.participant() == id && d.phase() == phase && d.reached_participant())
            .cloned()
            .collect()
    }

    pub fn clear_deliveries(&self) {
        self.deliveries.lock().clear();
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}
