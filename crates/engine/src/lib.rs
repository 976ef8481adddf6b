//! In-memory mock network for testing distributed transactions
//!
//! This crate routes coordinator RPCs to in-process participants, allowing
//! commit coordination to be exercised across several partitions with
//! injected partitions and transient failures.

use proven_common::ParticipantId;
use thiserror::Error;

pub mod client;
pub mod engine;
pub mod message;

pub use engine::MockNetwork;
pub use message::{Delivery, DeliveryOutcome};

/// Mock network errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Participant already registered: {0}")]
    DuplicateParticipant(ParticipantId),

    #[error("Unknown participant: {0}")]
    UnknownParticipant(ParticipantId),
}

pub type Result<T> = std::result::Result<T, EngineError>;
