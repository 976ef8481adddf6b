//! Transaction key
//!
//! A distributed transaction is addressed by the pair (session, txnNumber). The
//! same key is used by the coordinator, by every participant, and as the `_id`
//! of the persisted coordinator document.

use crate::{SessionId, TxnNumber};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encoded length of a key: 16 bytes of session UUID + 8 bytes of txnNumber
const ENCODED_LEN: usize = 24;

/// Identifies one transaction attempt on one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionKey {
    pub session_id: SessionId,
    pub txn_number: TxnNumber,
}

impl TransactionKey {
    pub fn new(session_id: SessionId, txn_number: impl Into<TxnNumber>) -> Self {
        Self {
            session_id,
            txn_number: txn_number.into(),
        }
    }

    /// Key for the next transaction on the same session
    pub fn next(&self) -> Self {
        Self {
            session_id: self.session_id,
            txn_number: self.txn_number.next(),
        }
    }

    /// Check if both keys address the same session
    pub fn same_session(&self, other: &Self) -> bool {
        self.session_id == other.session_id
    }

    /// Convert to bytes
    ///
    /// Keys of one session sort by txnNumber because the number is big-endian.
    pub fn to_bytes(&self) -> [u8; ENCODED_LEN] {
        let mut bytes = [0u8; ENCODED_LEN];
        bytes[..16].copy_from_slice(&self.session_id.to_bytes());
        bytes[16..].copy_from_slice(&self.txn_number.as_u64().to_be_bytes());
        bytes
    }

    /// Parse from bytes produced by [`TransactionKey::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != ENCODED_LEN {
            return Err(format!(
                "Invalid transaction key length: {} (expected {})",
                bytes.len(),
                ENCODED_LEN
            ));
        }

        let mut session = [0u8; 16];
        session.copy_from_slice(&bytes[..16]);
        let mut number = [0u8; 8];
        number.copy_from_slice(&bytes[16..]);

        Ok(Self {
            session_id: SessionId::from_bytes(session),
            txn_number: TxnNumber::new(u64::from_be_bytes(number)),
        })
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session_id, self.txn_number)
    }
}
