//! Common types for commit coordination
//!
//! This crate defines:
//! - Session identifiers and per-session transaction numbers
//! - Transaction keys (session + txnNumber) used to address a distributed transaction
//! - Participant and statement identifiers
//! - Physical timestamps (microseconds since Unix epoch)

mod key;
mod participant;
mod session;
mod statement;
mod timestamp;

pub use key::TransactionKey;
pub use participant::ParticipantId;
pub use session::{SessionId, TxnNumber};
pub use statement::StatementId;
pub use timestamp::Timestamp;
