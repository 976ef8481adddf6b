//! RPC surface of the mock network
//!
//! Implements the coordinator-facing `ParticipantClient` contract on top of
//! the network, plus statement routing for callers.

use crate::engine::MockNetwork;
use async_trait::async_trait;
use proven_common::{ParticipantId, TransactionKey};
use proven_hlc::HlcTimestamp;
use proven_protocol::{
    AddressedRequest, ControlRequest, ParticipantClient, ParticipantError, PrepareResponse, Result,
    StatementOutcome, StatementRequest,
};

#[async_trait]
impl ParticipantClient for MockNetwork {
    async fn prepare(
        &self,
        participant: &ParticipantId,
        key: &TransactionKey,
    ) -> Result<PrepareResponse> {
        let request = AddressedRequest {
            participant: participant.clone(),
            request: ControlRequest::Prepare { key: *key },
        };
        let target = self.route(&request).await?;
        let result = target.prepare(key);
        self.record(request, &result);
        result
    }

    async fn commit(
        &self,
        participant: &ParticipantId,
        key: &TransactionKey,
        commit_timestamp: HlcTimestamp,
    ) -> Result<()> {
        let request = AddressedRequest {
            participant: participant.clone(),
            request: ControlRequest::Commit {
                key: *key,
                commit_timestamp,
            },
        };
        let target = self.route(&request).await?;
        let result = target.commit(key, commit_timestamp);
        self.record(request, &result);
        result
    }

    async fn abort(&self, participant: &ParticipantId, key: &TransactionKey) -> Result<()> {
        let request = AddressedRequest {
            participant: participant.clone(),
            request: ControlRequest::Abort { key: *key },
        };
        let target = self.route(&request).await?;
        let result = target.abort(key);
        self.record(request, &result);
        result
    }
}

impl MockNetwork {
    /// Send a write statement straight to a participant.
    ///
    /// Statements bypass fault injection; only coordinator traffic is
    /// subject to partitions.
    pub fn execute(
        &self,
        participant: &ParticipantId,
        request: &StatementRequest,
    ) -> Result<StatementOutcome> {
        let target = self
            .participant(participant)
            .map_err(|_| ParticipantError::UnknownParticipant(participant.clone()))?;
        target.execute_statement(request)
    }
}
