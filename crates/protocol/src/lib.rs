//! Protocol definitions for coordinator-participant communication
//!
//! This crate defines the contracts between the commit coordinator and the
//! partitions it coordinates: typed requests and responses, the participant
//! error taxonomy, and the collaborator traits (`ParticipantClient`,
//! `SessionQuery`, `StatementExecutor`) that transports and participants
//! implement.

pub mod client;
pub mod error;
pub mod messages;
pub mod responses;

pub use client::{ParticipantClient, SessionQuery, StatementExecutor};
pub use error::{ParticipantError, Result};
pub use messages::{AddressedRequest, ControlRequest, StatementRequest, TransactionPhase};
pub use responses::{
    AbortReason, CommitDecision, LocalTransactionStatus, ParticipantSignal, ParticipantVote,
    PrepareResponse, StatementOutcome, VoteOutcome,
};
