//! Shared setup for coordinator scenario tests

#![allow(dead_code)]

use proven_common::{ParticipantId, SessionId, StatementId, TransactionKey};
use proven_coordinator::{
    CoordinatorConfig, CoordinatorService, DocumentStore, MemoryDocumentStore, RetryConfig,
};
use proven_engine::MockNetwork;
use proven_hlc::HlcTimestamp;
use proven_participant::Participant;
use proven_protocol::{StatementOutcome, StatementRequest};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn shard(name: &str) -> ParticipantId {
    ParticipantId::new(name)
}

pub fn shards(names: &[&str]) -> Vec<ParticipantId> {
    names.iter().map(|name| shard(name)).collect()
}

pub fn fresh_key() -> TransactionKey {
    TransactionKey::new(SessionId::new(), 1)
}

pub fn config() -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_commit_deadline(Duration::from_secs(5))
        .with_retry(
            RetryConfig::default()
                .with_initial_backoff(Duration::from_millis(10))
                .with_max_backoff(Duration::from_millis(200)),
        )
}

/// Participants on a mock network plus a coordinator co-located with the
/// first of them
pub struct Cluster {
    pub network: Arc<MockNetwork>,
    pub store: Arc<MemoryDocumentStore>,
    pub service: CoordinatorService,
    local: ParticipantId,
}

impl Cluster {
    pub fn new(names: &[&str]) -> Self {
        Self::with_config(names, config())
    }

    pub fn with_config(names: &[&str], config: CoordinatorConfig) -> Self {
        init_tracing();
        let network = Arc::new(MockNetwork::with_participants(names.iter().copied()).unwrap());
        let store = Arc::new(MemoryDocumentStore::new());
        let local = shard(names[0]);
        let service = Self::service_for(&network, store.clone(), &local, config);
        service.step_up(1).unwrap();
        Self {
            network,
            store,
            service,
            local,
        }
    }

    fn service_for(
        network: &Arc<MockNetwork>,
        store: Arc<MemoryDocumentStore>,
        local: &ParticipantId,
        config: CoordinatorConfig,
    ) -> CoordinatorService {
        let participant = network.participant(local).unwrap();
        CoordinatorService::new(config, store, network.clone())
            .with_local_participant(local.clone(), participant)
    }

    /// A second coordinator node over the same store and participants, not
    /// yet stepped up
    pub fn successor(&self) -> CoordinatorService {
        Self::service_for(
            &self.network,
            self.store.clone(),
            &self.local,
            self.service.config().clone(),
        )
    }

    pub fn participant(&self, name: &str) -> Arc<Participant> {
        self.network.participant(&shard(name)).unwrap()
    }

    /// Run the first statement of `key` on `name`
    pub fn write(&self, key: TransactionKey, name: &str) -> StatementOutcome {
        self.write_statement(key, name, json!({ "set": name }))
    }

    pub fn write_statement(
        &self,
        key: TransactionKey,
        name: &str,
        statement: Value,
    ) -> StatementOutcome {
        self.network
            .execute(
                &shard(name),
                &StatementRequest::start(key, StatementId(0), statement),
            )
            .unwrap()
    }

    /// Make `name`'s next prepare timestamp `logical + 1`
    pub fn set_clock(&self, name: &str, logical: u32) {
        let participant = self.participant(name);
        let node = participant.clock().node_id();
        participant
            .clock()
            .reset_to(HlcTimestamp::new(0, logical, node));
    }

    pub fn document_exists(&self, key: &TransactionKey) -> bool {
        self.store.get(key).unwrap().is_some()
    }
}

/// Poll `condition` until it holds, advancing tokio time between checks
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
