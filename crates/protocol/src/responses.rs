//! Typed responses returned by participants and by the coordinator

use proven_common::ParticipantId;
use proven_hlc::HlcTimestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Extra information a participant attaches to a response
///
/// A statement on one partition may touch another partition the caller did
/// not know about. The execution engine reports it explicitly here instead of
/// leaving the caller to infer it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParticipantSignal {
    #[default]
    Normal,
    AdditionalParticipants(BTreeSet<ParticipantId>),
}

impl ParticipantSignal {
    /// Build a signal from a set, collapsing an empty set to `Normal`
    pub fn from_participants(participants: BTreeSet<ParticipantId>) -> Self {
        if participants.is_empty() {
            Self::Normal
        } else {
            Self::AdditionalParticipants(participants)
        }
    }

    /// Participants in this signal that are not in `known`
    pub fn unknown_to(&self, known: &[ParticipantId]) -> BTreeSet<ParticipantId> {
        match self {
            Self::Normal => BTreeSet::new(),
            Self::AdditionalParticipants(participants) => participants
                .iter()
                .filter(|p| !known.contains(p))
                .cloned()
                .collect(),
        }
    }
}

/// Result of executing one write statement on a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementOutcome {
    pub result: serde_json::Value,
    pub signal: ParticipantSignal,
}

impl StatementOutcome {
    pub fn normal(result: serde_json::Value) -> Self {
        Self {
            result,
            signal: ParticipantSignal::Normal,
        }
    }
}

/// Raw acknowledgement of a prepare request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    /// Timestamp at which the participant prepared; `None` is treated as a refusal
    pub prepare_timestamp: Option<HlcTimestamp>,
    /// Participants the transaction touched through this participant
    pub signal: ParticipantSignal,
}

impl PrepareResponse {
    pub fn prepared(prepare_timestamp: HlcTimestamp) -> Self {
        Self {
            prepare_timestamp: Some(prepare_timestamp),
            signal: ParticipantSignal::Normal,
        }
    }
}

/// Why a transaction resolved to abort
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// A participant has no record of the transaction
    NoSuchTransaction,
    /// A participant's session moved past this transaction
    TransactionTooOld,
    /// Votes were not collected before the coordinator deadline
    Timeout,
    /// A participant acknowledged prepare without a prepare timestamp
    MissingPrepareTimestamp,
    /// A participant reported participants outside the finalized list
    ParticipantListChanged(BTreeSet<ParticipantId>),
    /// A participant refused for another reason
    Refused(String),
    /// Abort was requested explicitly by the caller
    Requested,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchTransaction => write!(f, "no such transaction"),
            Self::TransactionTooOld => write!(f, "transaction too old"),
            Self::Timeout => write!(f, "timed out waiting for votes"),
            Self::MissingPrepareTimestamp => write!(f, "prepare acknowledged without timestamp"),
            Self::ParticipantListChanged(extra) => {
                let names: Vec<&str> = extra.iter().map(|p| p.as_str()).collect();
                write!(f, "participant list changed after finalization: {}", names.join(","))
            }
            Self::Refused(reason) => write!(f, "participant refused: {}", reason),
            Self::Requested => write!(f, "abort requested"),
        }
    }
}

/// A participant's vote in the prepare round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteOutcome {
    Prepared(HlcTimestamp),
    VoteAbort(AbortReason),
}

/// Vote from one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantVote {
    pub participant: ParticipantId,
    pub outcome: VoteOutcome,
}

impl ParticipantVote {
    pub fn is_prepared(&self) -> bool {
        matches!(self.outcome, VoteOutcome::Prepared(_))
    }
}

/// Final outcome of commit coordination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitDecision {
    Commit { commit_timestamp: HlcTimestamp },
    Abort { reason: AbortReason },
}

impl CommitDecision {
    /// Apply the vote rule to a complete set of votes.
    ///
    /// Any refusal decides abort. Otherwise the commit timestamp is one
    /// logical tick after the largest prepare timestamp. An empty vote set
    /// cannot commit.
    pub fn from_votes(votes: &[ParticipantVote]) -> Self {
        let mut max_prepare: Option<HlcTimestamp> = None;

        for vote in votes {
            match &vote.outcome {
                VoteOutcome::VoteAbort(reason) => {
                    return Self::Abort {
                        reason: reason.clone(),
                    };
                }
                VoteOutcome::Prepared(ts) => {
                    max_prepare = Some(max_prepare.map_or(*ts, |max| max.max(*ts)));
                }
            }
        }

        match max_prepare {
            Some(max) => Self::Commit {
                commit_timestamp: max.tick(),
            },
            None => Self::Abort {
                reason: AbortReason::NoSuchTransaction,
            },
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, Self::Commit { .. })
    }

    pub fn commit_timestamp(&self) -> Option<HlcTimestamp> {
        match self {
            Self::Commit { commit_timestamp } => Some(*commit_timestamp),
            Self::Abort { .. } => None,
        }
    }
}

impl fmt::Display for CommitDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit { commit_timestamp } => write!(f, "commit at {}", commit_timestamp),
            Self::Abort { reason } => write!(f, "abort ({})", reason),
        }
    }
}

/// What a participant's session knows about one transaction key
///
/// Answer to the read-only recovery query; never blocks on an undecided
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTransactionStatus {
    /// The session has never seen this transaction
    Unknown,
    InProgress,
    Prepared,
    Committed(HlcTimestamp),
    Aborted,
    /// The session moved on to a newer transaction without committing this one
    Superseded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proven_hlc::NodeId;

    fn prepared(name: &str, logical: u32) -> ParticipantVote {
        ParticipantVote {
            participant: ParticipantId::new(name),
            outcome: VoteOutcome::Prepared(HlcTimestamp::new(0, logical, NodeId::new(1))),
        }
    }

    #[test]
    fn test_commit_timestamp_is_after_max_prepare() {
        let decision = CommitDecision::from_votes(&[prepared("a", 5), prepared("b", 7)]);
        assert_eq!(
            decision.commit_timestamp(),
            Some(HlcTimestamp::new(0, 8, NodeId::new(1)))
        );
    }

    #[test]
    fn test_any_refusal_aborts() {
        let refusal = ParticipantVote {
            participant: ParticipantId::new("b"),
            outcome: VoteOutcome::VoteAbort(AbortReason::NoSuchTransaction),
        };
        let decision = CommitDecision::from_votes(&[prepared("a", 5), refusal]);
        assert_eq!(
            decision,
            CommitDecision::Abort {
                reason: AbortReason::NoSuchTransaction
            }
        );
    }

    #[test]
    fn test_no_votes_cannot_commit() {
        assert!(!CommitDecision::from_votes(&[]).is_commit());
    }

    #[test]
    fn test_signal_unknown_to() {
        let known = vec![ParticipantId::new("a"), ParticipantId::new("b")];
        let signal = ParticipantSignal::AdditionalParticipants(
            [ParticipantId::new("b"), ParticipantId::new("c")]
                .into_iter()
                .collect(),
        );
        let unknown = signal.unknown_to(&known);
        assert_eq!(unknown.len(), 1);
        assert!(unknown.contains(&ParticipantId::new("c")));
        assert!(ParticipantSignal::Normal.unknown_to(&known).is_empty());
        assert_eq!(
            ParticipantSignal::from_participants(BTreeSet::new()),
            ParticipantSignal::Normal
        );
    }
}
