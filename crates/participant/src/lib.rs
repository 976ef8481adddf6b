//! In-process participant for cross-partition transactions
//!
//! A participant owns one data partition. Callers send write statements to it
//! directly; a commit coordinator later drives it through prepare and commit
//! or abort. This crate provides:
//! - `SessionRegistry`: per-session txnNumber fencing and transaction state
//! - `StatementExecutionCache`: replay of already-applied statements
//! - `Participant`: the write path tying both to a `StatementExecutor`

pub mod cache;
pub mod config;
pub mod executor;
pub mod participant;
pub mod session;

pub use cache::StatementExecutionCache;
pub use config::ParticipantConfig;
pub use executor::EchoExecutor;
pub use participant::{CommittedWrite, Participant};
pub use session::{ResolvedTransaction, SessionRecord, SessionRegistry, TxnState};
