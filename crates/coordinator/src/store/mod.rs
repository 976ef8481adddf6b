//! Coordinator document storage
//!
//! The store is the only durable state of the coordinator. Every method that
//! changes a document is durable once it returns.

mod fjall_store;
mod memory;

pub use fjall_store::{FjallDocumentStore, FjallStoreConfig};
pub use memory::MemoryDocumentStore;

use crate::document::{CoordinatorDocument, DocumentDecision};
use proven_common::{ParticipantId, TransactionKey};
use thiserror::Error;

/// Document store error types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document store is not writable")]
    NotWritable,

    #[error("No coordinator document for {0}")]
    NotFound(TransactionKey),

    #[error("Participant list of {0} is finalized")]
    ParticipantListFinalized(TransactionKey),

    #[error("Document for {0} has no decision yet")]
    DecisionPending(TransactionKey),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Transient failures that are retried with backoff
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::NotWritable | Self::Io(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage backend for coordinator documents
pub trait DocumentStore: Send + Sync {
    /// Insert the document unless one exists for its key; returns the stored one
    fn create_or_get(&self, document: CoordinatorDocument) -> StoreResult<CoordinatorDocument>;

    fn get(&self, key: &TransactionKey) -> StoreResult<Option<CoordinatorDocument>>;

    /// Append participants and optionally finalize the list
    fn add_participants(
        &self,
        key: &TransactionKey,
        participants: &[ParticipantId],
        finalize: bool,
    ) -> StoreResult<CoordinatorDocument>;

    /// Write the decision unless one is stored; returns the decision on disk.
    ///
    /// An abort also records `late_participants` as abort recipients.
    fn persist_decision(
        &self,
        key: &TransactionKey,
        decision: DocumentDecision,
        late_participants: &[ParticipantId],
    ) -> StoreResult<DocumentDecision>;

    /// Remove a decided document; deleting a missing document succeeds
    fn delete(&self, key: &TransactionKey) -> StoreResult<()>;

    /// Every stored document, ordered by key
    fn list(&self) -> StoreResult<Vec<CoordinatorDocument>>;
}
