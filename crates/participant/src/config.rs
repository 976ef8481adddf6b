//! Participant configuration

use serde::{Deserialize, Serialize};

/// Configuration for an in-memory participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantConfig {
    /// How many resolved transactions each session remembers after moving on
    pub resolved_history_limit: usize,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            resolved_history_limit: 64,
        }
    }
}

impl ParticipantConfig {
    pub fn with_resolved_history_limit(mut self, limit: usize) -> Self {
        self.resolved_history_limit = limit;
        self
    }
}
