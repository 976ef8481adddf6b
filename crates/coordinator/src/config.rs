//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When the participant list of a transaction stops accepting additions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantListPolicy {
    /// The list is final once the coordinator document is written. A
    /// participant reporting an unlisted participant during prepare forces
    /// an abort.
    #[default]
    FinalizeOnWrite,

    /// Newly reported participants are appended and the prepare round is
    /// restarted. The list becomes final after a round that reports nothing
    /// new.
    FinalizeOnFirstCleanRound,
}

/// Exponential backoff for retriable failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }
}

/// Configuration for commit coordination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long votes may be collected before the transaction aborts
    pub commit_deadline: Duration,

    /// Backoff for participant RPCs and document writes
    pub retry: RetryConfig,

    pub participant_list_policy: ParticipantListPolicy,

    /// Upper bound on prepare rounds restarted by newly reported participants
    pub max_prepare_rounds: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            commit_deadline: Duration::from_secs(30),
            retry: RetryConfig::default(),
            participant_list_policy: ParticipantListPolicy::default(),
            max_prepare_rounds: 4,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_commit_deadline(mut self, deadline: Duration) -> Self {
        self.commit_deadline = deadline;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_participant_list_policy(mut self, policy: ParticipantListPolicy) -> Self {
        self.participant_list_policy = policy;
        self
    }

    pub fn with_max_prepare_rounds(mut self, rounds: u32) -> Self {
        self.max_prepare_rounds = rounds.max(1);
        self
    }

    /// Load a configuration from JSON, using defaults for missing fields
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig::default()
            .with_initial_backoff(Duration::from_millis(10))
            .with_max_backoff(Duration::from_millis(50));

        assert_eq!(retry.delay(0), Duration::from_millis(10));
        assert_eq!(retry.delay(1), Duration::from_millis(20));
        assert_eq!(retry.delay(2), Duration::from_millis(40));
        assert_eq!(retry.delay(3), Duration::from_millis(50));
        assert_eq!(retry.delay(1000), Duration::from_millis(50));
    }

    #[test]
    fn test_config_from_json() {
        let config = CoordinatorConfig::from_json(
            r#"{"participant_list_policy": "finalize_on_first_clean_round", "max_prepare_rounds": 2}"#,
        )
        .unwrap();

        assert_eq!(
            config.participant_list_policy,
            ParticipantListPolicy::FinalizeOnFirstCleanRound
        );
        assert_eq!(config.max_prepare_rounds, 2);
        assert_eq!(config.commit_deadline, Duration::from_secs(30));
        assert_eq!(CoordinatorConfig::from_json("{}").unwrap(), CoordinatorConfig::default());
    }
}
