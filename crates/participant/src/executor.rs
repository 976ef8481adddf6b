//! Minimal statement executor for in-process participants
//!
//! Statements are JSON objects. The executor echoes the statement back as its
//! result and reports the participants listed under `"touches"` as additional
//! participants. A statement with `"fail": true` is rejected.

use proven_common::{ParticipantId, TransactionKey};
use proven_protocol::{ParticipantError, ParticipantSignal, Result, StatementExecutor, StatementOutcome};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

impl EchoExecutor {
    fn touched(statement: &Value) -> BTreeSet<ParticipantId> {
        statement
            .get("touches")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ParticipantId::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl StatementExecutor for EchoExecutor {
    fn execute(&self, key: &TransactionKey, statement: &Value) -> Result<StatementOutcome> {
        if statement.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(ParticipantError::StatementFailed(format!(
                "statement rejected in {}",
                key
            )));
        }

        Ok(StatementOutcome {
            result: statement.clone(),
            signal: ParticipantSignal::from_participants(Self::touched(statement)),
        })
    }
}
