// CROSS-SHARD COMMIT COORDINATION
// Identifiers - sessions, transaction numbers, shards and timestamps
//
// SAFETY INVARIANTS:
// 1. A TransactionId is the unique key for all coordinator state
// 2. Transaction numbers are monotonic per session
// 3. Shard identifiers compare by name so participant ordering is deterministic

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Logical session identifier (16 opaque bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh random session id
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SessionId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Short hex form used in log lines
    pub fn as_hex(&self) -> String {
        hex::encode(&self.as_bytes()[..6])
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session monotonic transaction number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnNumber(pub u64);

impl fmt::Display for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique key of a distributed transaction: (session, txnNumber)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionId {
    #[serde(rename = "lsid")]
    pub session_id: SessionId,
    pub txn_number: TxnNumber,
}

impl TransactionId {
    pub fn new(session_id: SessionId, txn_number: u64) -> Self {
        TransactionId {
            session_id,
            txn_number: TxnNumber(txn_number),
        }
    }

    /// Order-preserving storage key: session bytes followed by the big-endian txnNumber
    pub fn storage_key(&self) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..16].copy_from_slice(self.session_id.as_bytes());
        key[16..].copy_from_slice(&self.txn_number.0.to_be_bytes());
        key
    }

    pub fn from_storage_key(key: &[u8]) -> Option<Self> {
        if key.len() != 24 {
            return None;
        }
        let mut session = [0u8; 16];
        session.copy_from_slice(&key[..16]);
        let mut number = [0u8; 8];
        number.copy_from_slice(&key[16..]);
        Some(TransactionId::new(
            SessionId::from_bytes(session),
            u64::from_be_bytes(number),
        ))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id.as_hex(), self.txn_number)
    }
}

/// Participant shard identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub String);

impl ShardId {
    pub fn new(name: impl Into<String>) -> Self {
        ShardId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(name: &str) -> Self {
        ShardId(name.to_string())
    }
}

/// Logical cluster timestamp (prepare and commit points)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_round_trips_and_orders_by_txn_number() {
        let session = SessionId::from_bytes([7u8; 16]);
        let low = TransactionId::new(session, 2);
        let high = TransactionId::new(session, 300);

        assert_eq!(TransactionId::from_storage_key(&low.storage_key()), Some(low));
        assert!(low.storage_key() < high.storage_key());
        assert_eq!(TransactionId::from_storage_key(&[1, 2, 3]), None);
    }

    #[test]
    fn test_transaction_id_json_uses_wire_names() {
        let txn_id = TransactionId::new(SessionId::from_bytes([1u8; 16]), 5);
        let json = serde_json::to_value(txn_id).unwrap();

        assert!(json.get("lsid").is_some());
        assert_eq!(json["txnNumber"], 5);
    }
}
