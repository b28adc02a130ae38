// CROSS-SHARD COMMIT COORDINATION
// Error taxonomy - user-visible coordinator errors, decision log errors,
// participant RPC errors and their retry classification

use crate::decision::Decision;
use crate::ids::{SessionId, ShardId, Timestamp, TransactionId, TxnNumber};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire error codes exchanged in command replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    // Transport / replica-set churn
    HostUnreachable,
    NetworkTimeout,
    NotWritablePrimary,
    PrimarySteppedDown,
    InterruptedDueToReplStateChange,
    ShutdownInProgress,
    LockBusy,

    // Shard ownership changed under a concurrent DDL
    StaleConfig,
    StaleEpoch,
    StaleDbVersion,

    // Transaction state
    NoSuchTransaction,
    TransactionTooOld,
    TransactionCommitted,
    TransactionAborted,
    WriteConflict,
    MaxTimeMsExpired,
    InvalidOptions,
    InternalError,
}

/// Retry classification of a participant error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried indefinitely with backoff
    Retryable,
    /// Retried during prepare up to the stale retry limit, then abort-causing
    Stale,
    /// Abort-causing during prepare
    Terminal,
}

impl ErrorCode {
    /// Retry classification table used by the coordinator during prepare.
    ///
    /// After a decision exists every error is retried regardless of class.
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorCode::HostUnreachable
            | ErrorCode::NetworkTimeout
            | ErrorCode::NotWritablePrimary
            | ErrorCode::PrimarySteppedDown
            | ErrorCode::InterruptedDueToReplStateChange
            | ErrorCode::ShutdownInProgress
            | ErrorCode::LockBusy => ErrorClass::Retryable,

            ErrorCode::StaleConfig | ErrorCode::StaleEpoch | ErrorCode::StaleDbVersion => {
                ErrorClass::Stale
            }

            ErrorCode::NoSuchTransaction
            | ErrorCode::TransactionTooOld
            | ErrorCode::TransactionCommitted
            | ErrorCode::TransactionAborted
            | ErrorCode::WriteConflict
            | ErrorCode::MaxTimeMsExpired
            | ErrorCode::InvalidOptions
            | ErrorCode::InternalError => ErrorClass::Terminal,
        }
    }
}

/// Errors returned by a participant RPC
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParticipantError {
    #[error("shard {shard} replied {code:?}: {message}")]
    Command {
        shard: ShardId,
        code: ErrorCode,
        message: String,
    },

    #[error("transport to shard {shard} failed: {reason}")]
    Transport { shard: ShardId, reason: String },

    #[error("malformed reply from shard {shard}: {reason}")]
    MalformedReply { shard: ShardId, reason: String },
}

impl ParticipantError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ParticipantError::Command { code, .. } => code.class(),
            ParticipantError::Transport { .. } => ErrorClass::Retryable,
            ParticipantError::MalformedReply { .. } => ErrorClass::Terminal,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ParticipantError::Command { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Errors from the durable decision log
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecisionLogError {
    #[error("not primary: write rejected at term {term}")]
    NotPrimary { term: u64 },

    #[error("decision for {txn_id} already persisted as {existing}, refusing {attempted}")]
    DecisionConflict {
        txn_id: TransactionId,
        existing: Decision,
        attempted: Decision,
    },

    #[error("coordinator document for {txn_id} already exists with a different participant list")]
    ParticipantListConflict { txn_id: TransactionId },

    #[error("no coordinator document for {txn_id}")]
    DocumentNotFound { txn_id: TransactionId },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("record codec failure: {0}")]
    Codec(String),
}

/// Coordinator result alias
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Decision log result alias
pub type LogResult<T> = Result<T, DecisionLogError>;

/// User-visible coordinator errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("this node is not primary for the coordinator replica set")]
    NotPrimary,

    #[error("coordination of {txn_id} interrupted: {reason}")]
    Interrupted { txn_id: TransactionId, reason: String },

    #[error("transaction {txn_id} aborted: {reason}")]
    TransactionAborted { txn_id: TransactionId, reason: String },

    #[error("transaction {txn_id} already decided to commit at {commit_timestamp}")]
    TransactionCommitted {
        txn_id: TransactionId,
        commit_timestamp: Timestamp,
    },

    #[error("shard {shard} reports {txn_id} already committed; no new decision was made")]
    ParticipantAlreadyCommitted { txn_id: TransactionId, shard: ShardId },

    #[error("txnNumber {requested} on session {session_id} is older than {highest}")]
    TransactionTooOld {
        session_id: SessionId,
        requested: TxnNumber,
        highest: TxnNumber,
    },

    #[error("no transaction {txn_id} in progress (missing startTransaction)")]
    NoSuchTransaction { txn_id: TransactionId },

    #[error("participant list for {txn_id} differs from the one already being coordinated")]
    ParticipantListMismatch { txn_id: TransactionId },

    #[error("participant list must not be empty")]
    EmptyParticipantList,

    #[error("gave up waiting for {txn_id} after {waited_ms}ms; coordination continues")]
    MaxTimeMsExpired { txn_id: TransactionId, waited_ms: u64 },

    #[error("decision log: {0}")]
    DecisionLog(#[from] DecisionLogError),
}

impl CoordinatorError {
    /// Wire code reported to the caller
    pub fn code(&self) -> ErrorCode {
        match self {
            CoordinatorError::NotPrimary => ErrorCode::NotWritablePrimary,
            CoordinatorError::Interrupted { .. } => ErrorCode::InterruptedDueToReplStateChange,
            CoordinatorError::TransactionAborted { .. } => ErrorCode::NoSuchTransaction,
            CoordinatorError::TransactionCommitted { .. }
            | CoordinatorError::ParticipantAlreadyCommitted { .. } => ErrorCode::TransactionCommitted,
            CoordinatorError::TransactionTooOld { .. } => ErrorCode::TransactionTooOld,
            CoordinatorError::NoSuchTransaction { .. } => ErrorCode::NoSuchTransaction,
            CoordinatorError::ParticipantListMismatch { .. }
            | CoordinatorError::EmptyParticipantList => ErrorCode::InvalidOptions,
            CoordinatorError::MaxTimeMsExpired { .. } => ErrorCode::MaxTimeMsExpired,
            CoordinatorError::DecisionLog(DecisionLogError::NotPrimary { .. }) => {
                ErrorCode::NotWritablePrimary
            }
            CoordinatorError::DecisionLog(_) => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        assert_eq!(ErrorCode::HostUnreachable.class(), ErrorClass::Retryable);
        assert_eq!(ErrorCode::LockBusy.class(), ErrorClass::Retryable);
        assert_eq!(ErrorCode::StaleEpoch.class(), ErrorClass::Stale);
        assert_eq!(ErrorCode::NoSuchTransaction.class(), ErrorClass::Terminal);
    }

    #[test]
    fn test_transport_failures_are_retryable() {
        let err = ParticipantError::Transport {
            shard: ShardId::new("s1"),
            reason: "connection reset".into(),
        };
        assert_eq!(err.class(), ErrorClass::Retryable);
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_log_not_primary_maps_to_not_writable_primary() {
        let err: CoordinatorError = DecisionLogError::NotPrimary { term: 3 }.into();
        assert_eq!(err.code(), ErrorCode::NotWritablePrimary);
    }
}
