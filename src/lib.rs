//! Cross-partition commit coordination
//!
//! Facade over the workspace crates:
//! - `common`: transaction keys and identifiers
//! - `hlc`: hybrid logical clock for prepare and commit timestamps
//! - `protocol`: contracts between the coordinator and participants
//! - `participant`: session registry, statement cache and write path
//! - `engine`: in-process network with fault injection
//! - `coordinator`: two-phase commit, document stores and recovery

pub use proven_common as common;
pub use proven_coordinator as coordinator;
pub use proven_engine as engine;
pub use proven_hlc as hlc;
pub use proven_participant as participant;
pub use proven_protocol as protocol;

pub use proven_coordinator::{CoordinatorConfig, CoordinatorService};
pub use proven_protocol::CommitDecision;
