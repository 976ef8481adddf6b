//! Durable document store backed by Fjall

use super::{DocumentStore, StoreError, StoreResult};
use crate::document::{CoordinatorDocument, DocumentDecision};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::Mutex;
use proven_common::{ParticipantId, TransactionKey};
use std::path::PathBuf;

const PARTITION_NAME: &str = "coordinator_documents";

/// Configuration for the Fjall document store
#[derive(Clone)]
pub struct FjallStoreConfig {
    /// Directory for keyspace data
    pub data_dir: PathBuf,

    /// Block cache size for Fjall (in bytes)
    pub block_cache_size: u64,

    /// Persist mode applied after every write
    pub persist_mode: PersistMode,
}

impl FjallStoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            block_cache_size: 8 * 1024 * 1024, // 8 MB
            persist_mode: PersistMode::SyncAll,
        }
    }

    pub fn with_block_cache_size(mut self, size: u64) -> Self {
        self.block_cache_size = size;
        self
    }

    pub fn with_persist_mode(mut self, mode: PersistMode) -> Self {
        self.persist_mode = mode;
        self
    }
}

/// Coordinator documents in a Fjall partition, CBOR encoded
pub struct FjallDocumentStore {
    keyspace: Keyspace,
    documents: PartitionHandle,
    persist_mode: PersistMode,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl FjallDocumentStore {
    /// Open (or create) the store at the configured directory
    pub fn open(config: FjallStoreConfig) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let keyspace = fjall::Config::new(&config.data_dir)
            .cache_size(config.block_cache_size)
            .open()?;

        let documents = keyspace.open_partition(
            PARTITION_NAME,
            PartitionCreateOptions::default()
                .block_size(16 * 1024)
                .compression(fjall::CompressionType::None),
        )?;

        Ok(Self {
            keyspace,
            documents,
            persist_mode: config.persist_mode,
            write_lock: Mutex::new(()),
        })
    }

    fn load(&self, key: &TransactionKey) -> StoreResult<Option<CoordinatorDocument>> {
        match self.documents.get(key.to_bytes())? {
            Some(bytes) => Ok(Some(CoordinatorDocument::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, document: &CoordinatorDocument) -> StoreResult<()> {
        self.documents
            .insert(document.storage_key().to_vec(), document.to_bytes()?)?;
        self.keyspace.persist(self.persist_mode)?;
        Ok(())
    }

    fn update<T>(
        &self,
        key: &TransactionKey,
        apply: impl FnOnce(&mut CoordinatorDocument) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let _guard = self.write_lock.lock();
        let mut document = self.load(key)?.ok_or(StoreError::NotFound(*key))?;
        let result = apply(&mut document)?;
        self.save(&document)?;
        Ok(result)
    }
}

impl DocumentStore for FjallDocumentStore {
    fn create_or_get(&self, document: CoordinatorDocument) -> StoreResult<CoordinatorDocument> {
        let _guard = self.write_lock.lock();
        if let Some(existing) = self.load(&document.id)? {
            return Ok(existing);
        }
        self.save(&document)?;
        Ok(document)
    }

    fn get(&self, key: &TransactionKey) -> StoreResult<Option<CoordinatorDocument>> {
        self.load(key)
    }

    fn add_participants(
        &self,
        key: &TransactionKey,
        participants: &[ParticipantId],
        finalize: bool,
    ) -> StoreResult<CoordinatorDocument> {
        self.update(key, |document| {
            document.add_participants(participants, finalize)?;
            Ok(document.clone())
        })
    }

    fn persist_decision(
        &self,
        key: &TransactionKey,
        decision: DocumentDecision,
        late_participants: &[ParticipantId],
    ) -> StoreResult<DocumentDecision> {
        self.update(key, |document| {
            Ok(document.decide(decision, late_participants))
        })
    }

    fn delete(&self, key: &TransactionKey) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        match self.load(key)? {
            None => Ok(()),
            Some(document) if document.decision.is_pending() => {
                Err(StoreError::DecisionPending(*key))
            }
            Some(_) => {
                self.documents.remove(key.to_bytes().to_vec())?;
                self.keyspace.persist(self.persist_mode)?;
                Ok(())
            }
        }
    }

    fn list(&self) -> StoreResult<Vec<CoordinatorDocument>> {
        let mut documents = Vec::new();
        for entry in self.documents.iter() {
            let (_key, value) = entry?;
            documents.push(CoordinatorDocument::from_bytes(&value)?);
        }
        Ok(documents)
    }
}
