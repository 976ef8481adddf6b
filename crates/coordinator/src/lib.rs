//! Cross-partition commit coordinator
//!
//! Runs two-phase commit for transactions that wrote to more than one
//! participant. Each transaction key gets one coordinator task that persists
//! a coordinator document, collects prepare votes, durably records the
//! decision and then delivers it. A node that loses its coordinating role
//! leaves the documents behind and the next node to step up resumes them.

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod document;
pub mod error;
pub mod recovery;
pub mod retry;
pub mod service;
pub mod store;

pub use catalog::CoordinatorCatalog;
pub use config::{CoordinatorConfig, ParticipantListPolicy, RetryConfig};
pub use coordinator::{
    CoordinationStart, CoordinatorContext, CoordinatorDriver, CoordinatorProgress,
    TransactionCoordinator,
};
pub use diagnostics::{CoordinatorMetrics, CoordinatorReport, MetricsSnapshot};
pub use document::{CoordinatorDocument, CoordinatorState, DocumentDecision};
pub use error::{CoordinatorError, Result};
pub use recovery::RecoveryService;
pub use service::CoordinatorService;
pub use store::{
    DocumentStore, FjallDocumentStore, FjallStoreConfig, MemoryDocumentStore, StoreError,
};
