//! Typed requests sent to participants

use proven_common::{ParticipantId, StatementId, TransactionKey};
use proven_hlc::HlcTimestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction phases in the 2PC protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionPhase {
    /// Prepare phase (vote request)
    Prepare,
    /// Commit phase (decision)
    Commit,
    /// Abort phase (decision)
    Abort,
}

impl TransactionPhase {
    /// Parse from string value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prepare" => Some(Self::Prepare),
            "commit" => Some(Self::Commit),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }

    /// Convert to string value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Abort => "abort",
        }
    }
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction control request (prepare/commit/abort) addressed to one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    Prepare {
        key: TransactionKey,
    },
    Commit {
        key: TransactionKey,
        commit_timestamp: HlcTimestamp,
    },
    Abort {
        key: TransactionKey,
    },
}

impl ControlRequest {
    pub fn key(&self) -> &TransactionKey {
        match self {
            Self::Prepare { key } | Self::Commit { key, .. } | Self::Abort { key } => key,
        }
    }

    pub fn phase(&self) -> TransactionPhase {
        match self {
            Self::Prepare { .. } => TransactionPhase::Prepare,
            Self::Commit { .. } => TransactionPhase::Commit,
            Self::Abort { .. } => TransactionPhase::Abort,
        }
    }
}

/// Write statement sent by a caller directly to a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementRequest {
    /// Transaction the statement belongs to
    pub key: TransactionKey,
    /// Position of the statement within the transaction attempt
    pub statement_id: StatementId,
    /// Whether this statement opens the transaction on the participant
    pub start_transaction: bool,
    /// Opaque statement payload for the execution engine
    pub statement: serde_json::Value,
}

impl StatementRequest {
    /// First statement of a transaction on a participant
    pub fn start(key: TransactionKey, statement_id: StatementId, statement: serde_json::Value) -> Self {
        Self {
            key,
            statement_id,
            start_transaction: true,
            statement,
        }
    }

    /// Follow-up statement of an already started transaction
    pub fn continuing(
        key: TransactionKey,
        statement_id: StatementId,
        statement: serde_json::Value,
    ) -> Self {
        Self {
            key,
            statement_id,
            start_transaction: false,
            statement,
        }
    }
}

/// A control request together with the participant it was addressed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressedRequest {
    pub participant: ParticipantId,
    pub request: ControlRequest,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proven_common::SessionId;

    #[test]
    fn test_phase_parse() {
        for phase in [
            TransactionPhase::Prepare,
            TransactionPhase::Commit,
            TransactionPhase::Abort,
        ] {
            assert_eq!(TransactionPhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(TransactionPhase::parse("prepare_and_commit"), None);
    }

    #[test]
    fn test_control_request_accessors() {
        let key = TransactionKey::new(SessionId::new(), 1);
        let request = ControlRequest::Abort { key };
        assert_eq!(request.key(), &key);
        assert_eq!(request.phase(), TransactionPhase::Abort);
    }
}
