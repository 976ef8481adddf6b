//! Delivery records kept by the mock network
//!
//! Every control RPC that reaches the network is logged, whether it was
//! delivered or dropped by an injected fault, so tests can check exactly what
//! each participant was told and how many times.

use proven_common::{ParticipantId, TransactionKey};
use proven_hlc::HlcTimestamp;
use proven_protocol::{AddressedRequest, ControlRequest, ParticipantError, TransactionPhase};

/// What happened to one RPC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The participant handled the request successfully
    Acknowledged,
    /// The participant handled the request and returned an error
    Rejected(ParticipantError),
    /// The network dropped the request before it reached the participant
    Dropped(ParticipantError),
}

/// One logged RPC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub request: AddressedRequest,
    pub outcome: DeliveryOutcome,
}

impl Delivery {
    pub fn participant(&self) -> &ParticipantId {
        &self.request.participant
    }

    pub fn phase(&self) -> TransactionPhase {
        self.request.request.phase()
    }

    pub fn key(&self) -> &TransactionKey {
        self.request.request.key()
    }

    /// Whether the participant actually processed the request
    pub fn reached_participant(&self) -> bool {
        !matches!(self.outcome, DeliveryOutcome::Dropped(_))
    }

    /// Commit timestamp carried by a commit request
    pub fn commit_timestamp(&self) -> Option<HlcTimestamp> {
        match &self.request.request {
            ControlRequest::Commit {
                commit_timestamp, ..
            } => Some(*commit_timestamp),
            _ => None,
        }
    }
}
