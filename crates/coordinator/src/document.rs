//! Durable coordinator document
//!
//! One document per transaction key records the participant list, the
//! coordinator state and the decision. Writing the decision into it is the
//! point after which the outcome of the transaction can no longer change.

use crate::store::{StoreError, StoreResult};
use proven_common::{ParticipantId, Timestamp, TransactionKey};
use proven_hlc::HlcTimestamp;
use proven_protocol::{AbortReason, CommitDecision};
use serde::{Deserialize, Serialize};
use std::fmt;

/// States of the commit coordination state machine, in protocol order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoordinatorState {
    Init,
    WritingParticipantList,
    SendingPrepare,
    WaitingForVotes,
    WritingDecision,
    SendingDecision,
    WaitingForDecisionAcks,
    DeletingDocument,
    Done,
    /// Abandoned before a decision became durable
    Aborted,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::WritingParticipantList => "writing_participant_list",
            Self::SendingPrepare => "sending_prepare",
            Self::WaitingForVotes => "waiting_for_votes",
            Self::WritingDecision => "writing_decision",
            Self::SendingDecision => "sending_decision",
            Self::WaitingForDecisionAcks => "waiting_for_decision_acks",
            Self::DeletingDocument => "deleting_document",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// Position in the protocol; `Aborted` has none
    pub fn ordinal(&self) -> Option<u8> {
        match self {
            Self::Init => Some(0),
            Self::WritingParticipantList => Some(1),
            Self::SendingPrepare => Some(2),
            Self::WaitingForVotes => Some(3),
            Self::WritingDecision => Some(4),
            Self::SendingDecision => Some(5),
            Self::WaitingForDecisionAcks => Some(6),
            Self::DeletingDocument => Some(7),
            Self::Done => Some(8),
            Self::Aborted => None,
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision slot of the document
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DocumentDecision {
    #[default]
    Pending,
    Commit {
        commit_timestamp: HlcTimestamp,
    },
    Abort {
        reason: AbortReason,
    },
}

impl DocumentDecision {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn to_decision(&self) -> Option<CommitDecision> {
        match self {
            Self::Pending => None,
            Self::Commit { commit_timestamp } => Some(CommitDecision::Commit {
                commit_timestamp: *commit_timestamp,
            }),
            Self::Abort { reason } => Some(CommitDecision::Abort {
                reason: reason.clone(),
            }),
        }
    }
}

impl From<CommitDecision> for DocumentDecision {
    fn from(decision: CommitDecision) -> Self {
        match decision {
            CommitDecision::Commit { commit_timestamp } => Self::Commit { commit_timestamp },
            CommitDecision::Abort { reason } => Self::Abort { reason },
        }
    }
}

/// Persisted record of one transaction's commit coordination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorDocument {
    #[serde(rename = "_id")]
    pub id: TransactionKey,
    /// Ordered, duplicate free, append only until finalized
    pub participants: Vec<ParticipantId>,
    pub participants_finalized: bool,
    pub state: CoordinatorState,
    pub decision: DocumentDecision,
    /// Votes not collected by this time count as a timeout
    pub deadline: Timestamp,
    /// Reported during prepare but never admitted to the list; they only
    /// ever receive an abort
    #[serde(default)]
    pub abort_recipients: Vec<ParticipantId>,
}

impl CoordinatorDocument {
    pub fn new(
        id: TransactionKey,
        participants: impl IntoIterator<Item = ParticipantId>,
        participants_finalized: bool,
        deadline: Timestamp,
    ) -> Self {
        let mut document = Self {
            id,
            participants: Vec::new(),
            participants_finalized,
            state: CoordinatorState::SendingPrepare,
            decision: DocumentDecision::Pending,
            deadline,
            abort_recipients: Vec::new(),
        };
        document.push_participants(participants);
        document
    }

    fn push_participants(&mut self, participants: impl IntoIterator<Item = ParticipantId>) -> bool {
        let mut changed = false;
        for participant in participants {
            if !self.participants.contains(&participant) {
                self.participants.push(participant);
                changed = true;
            }
        }
        changed
    }

    /// Append participants and optionally finalize the list.
    ///
    /// Appending to a finalized list is an error; finalizing twice is not.
    pub fn add_participants(
        &mut self,
        participants: &[ParticipantId],
        finalize: bool,
    ) -> StoreResult<()> {
        let unknown: Vec<ParticipantId> = participants
            .iter()
            .filter(|p| !self.participants.contains(p))
            .cloned()
            .collect();

        if !unknown.is_empty() && self.participants_finalized {
            return Err(StoreError::ParticipantListFinalized(self.id));
        }
        self.push_participants(unknown);
        self.participants_finalized |= finalize;
        Ok(())
    }

    /// Record a decision unless one is already stored; returns the stored one.
    ///
    /// `late_participants` are kept only when an abort is recorded.
    pub fn decide(
        &mut self,
        decision: DocumentDecision,
        late_participants: &[ParticipantId],
    ) -> DocumentDecision {
        if self.decision.is_pending() {
            self.decision = decision;
            self.state = CoordinatorState::SendingDecision;
            if matches!(self.decision, DocumentDecision::Abort { .. }) {
                for participant in late_participants {
                    if !self.participants.contains(participant)
                        && !self.abort_recipients.contains(participant)
                    {
                        self.abort_recipients.push(participant.clone());
                    }
                }
            }
        }
        self.decision.clone()
    }

    /// Everyone the stored decision must reach
    pub fn decision_recipients(&self) -> Vec<ParticipantId> {
        let mut recipients = self.participants.clone();
        if matches!(self.decision, DocumentDecision::Abort { .. }) {
            recipients.extend(self.abort_recipients.iter().cloned());
        }
        recipients
    }

    /// Storage key: session uuid bytes followed by the big-endian txnNumber
    pub fn storage_key(&self) -> [u8; 24] {
        self.id.to_bytes()
    }

    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| StoreError::Encoding(format!("Failed to encode document: {}", e)))?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| StoreError::Encoding(format!("Failed to decode document: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proven_common::SessionId;
    use proven_hlc::NodeId;

    fn document(finalized: bool) -> CoordinatorDocument {
        CoordinatorDocument::new(
            TransactionKey::new(SessionId::new(), 7),
            [
                ParticipantId::new("a"),
                ParticipantId::new("b"),
                ParticipantId::new("a"),
            ],
            finalized,
            Timestamp::from_micros(1_000),
        )
    }

    #[test]
    fn test_participants_are_deduplicated_in_order() {
        let document = document(true);
        assert_eq!(
            document.participants,
            vec![ParticipantId::new("a"), ParticipantId::new("b")]
        );
    }

    #[test]
    fn test_finalized_list_rejects_additions() {
        let mut document = document(true);
        assert!(document.add_participants(&[ParticipantId::new("b")], true).is_ok());
        assert!(matches!(
            document.add_participants(&[ParticipantId::new("c")], false),
            Err(StoreError::ParticipantListFinalized(_))
        ));

        let mut open = document_open();
        open.add_participants(&[ParticipantId::new("c")], false).unwrap();
        assert_eq!(open.participants.len(), 3);
        assert!(!open.participants_finalized);
        open.add_participants(&[], true).unwrap();
        assert!(open.participants_finalized);
    }

    fn document_open() -> CoordinatorDocument {
        document(false)
    }

    #[test]
    fn test_stored_decision_wins() {
        let mut document = document(true);
        let commit = DocumentDecision::Commit {
            commit_timestamp: HlcTimestamp::new(0, 8, NodeId::new(1)),
        };

        let late = [ParticipantId::new("c")];
        assert_eq!(document.decide(commit.clone(), &late), commit);
        assert_eq!(
            document.decide(
                DocumentDecision::Abort {
                    reason: AbortReason::Timeout
                },
                &late
            ),
            commit
        );
        assert_eq!(document.state, CoordinatorState::SendingDecision);
        assert!(document.abort_recipients.is_empty());
        assert_eq!(document.decision_recipients(), document.participants);
    }

    #[test]
    fn test_abort_reaches_late_participants() {
        let mut document = document(true);
        document.decide(
            DocumentDecision::Abort {
                reason: AbortReason::Timeout,
            },
            &[ParticipantId::new("b"), ParticipantId::new("c")],
        );

        assert_eq!(document.abort_recipients, vec![ParticipantId::new("c")]);
        assert_eq!(
            document.decision_recipients(),
            vec![
                ParticipantId::new("a"),
                ParticipantId::new("b"),
                ParticipantId::new("c")
            ]
        );
    }

    #[test]
    fn test_cbor_encoding() {
        let mut document = document(false);
        document.decide(
            DocumentDecision::Abort {
                reason: AbortReason::ParticipantListChanged(
                    [ParticipantId::new("z")].into_iter().collect(),
                ),
            },
            &[ParticipantId::new("z")],
        );

        let decoded = CoordinatorDocument::from_bytes(&document.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, document);
        assert!(CoordinatorDocument::from_bytes(b"garbage").is_err());
    }

    #[test]
    fn test_state_order() {
        assert!(
            CoordinatorState::WritingDecision.ordinal() < CoordinatorState::SendingDecision.ordinal()
        );
        assert_eq!(CoordinatorState::Aborted.ordinal(), None);
        assert!(CoordinatorState::Aborted.is_terminal());
        assert!(!CoordinatorState::WaitingForVotes.is_terminal());
    }
}
