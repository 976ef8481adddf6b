//! Statement identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a write statement within one transaction attempt
///
/// Assigned by the caller; a retried statement carries the same ID so that the
/// participant can replay its cached result instead of applying it twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatementId(pub u32);

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt-{}", self.0)
    }
}
