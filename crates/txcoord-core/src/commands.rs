// CROSS-SHARD COMMIT COORDINATION
// Wire Commands - JSON command bodies exchanged with participants and clients
//
// Command bodies carry the command name under "command" and the transaction
// key as "lsid"/"txnNumber". Replies carry "ok" plus either a payload or a
// "codeName"/"errmsg" pair.

use crate::decision::{Decision, Vote};
use crate::error::{CoordinatorError, ErrorCode, ParticipantError};
use crate::ids::{SessionId, ShardId, Timestamp, TransactionId, TxnNumber};
use serde::{Deserialize, Serialize};

/// Commands the coordinator sends to a participant shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ParticipantCommand {
    #[serde(rename_all = "camelCase")]
    PrepareTransaction { lsid: SessionId, txn_number: TxnNumber },

    #[serde(rename_all = "camelCase")]
    CommitTransaction {
        lsid: SessionId,
        txn_number: TxnNumber,
        commit_timestamp: Timestamp,
    },

    #[serde(rename_all = "camelCase")]
    AbortTransaction { lsid: SessionId, txn_number: TxnNumber },
}

impl ParticipantCommand {
    pub fn prepare(txn_id: &TransactionId) -> Self {
        ParticipantCommand::PrepareTransaction {
            lsid: txn_id.session_id,
            txn_number: txn_id.txn_number,
        }
    }

    pub fn commit(txn_id: &TransactionId, commit_timestamp: Timestamp) -> Self {
        ParticipantCommand::CommitTransaction {
            lsid: txn_id.session_id,
            txn_number: txn_id.txn_number,
            commit_timestamp,
        }
    }

    pub fn abort(txn_id: &TransactionId) -> Self {
        ParticipantCommand::AbortTransaction {
            lsid: txn_id.session_id,
            txn_number: txn_id.txn_number,
        }
    }

    pub fn txn_id(&self) -> TransactionId {
        match self {
            ParticipantCommand::PrepareTransaction { lsid, txn_number }
            | ParticipantCommand::CommitTransaction { lsid, txn_number, .. }
            | ParticipantCommand::AbortTransaction { lsid, txn_number } => TransactionId {
                session_id: *lsid,
                txn_number: *txn_number,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParticipantCommand::PrepareTransaction { .. } => "prepareTransaction",
            ParticipantCommand::CommitTransaction { .. } => "commitTransaction",
            ParticipantCommand::AbortTransaction { .. } => "abortTransaction",
        }
    }
}

/// Participant reply body
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote_abort_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_name: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

impl ParticipantReply {
    pub fn ack() -> Self {
        ParticipantReply {
            ok: true,
            ..Default::default()
        }
    }

    pub fn from_vote(vote: &Vote) -> Self {
        match vote {
            Vote::Commit { prepare_timestamp } => ParticipantReply {
                ok: true,
                prepare_timestamp: Some(*prepare_timestamp),
                ..Default::default()
            },
            Vote::Abort { reason } => ParticipantReply {
                ok: true,
                vote_abort_reason: Some(reason.clone()),
                ..Default::default()
            },
        }
    }

    pub fn error(code: ErrorCode, errmsg: impl Into<String>) -> Self {
        ParticipantReply {
            ok: false,
            code_name: Some(code),
            errmsg: Some(errmsg.into()),
            ..Default::default()
        }
    }

    fn command_error(&self, shard: &ShardId) -> Option<ParticipantError> {
        if self.ok {
            return None;
        }
        let err = match self.code_name {
            Some(code) => ParticipantError::Command {
                shard: shard.clone(),
                code,
                message: self.errmsg.clone().unwrap_or_default(),
            },
            None => ParticipantError::MalformedReply {
                shard: shard.clone(),
                reason: "ok:false without codeName".to_string(),
            },
        };
        Some(err)
    }

    /// Interpret a reply to `prepareTransaction`
    pub fn into_vote(self, shard: &ShardId) -> Result<Vote, ParticipantError> {
        if let Some(err) = self.command_error(shard) {
            return Err(err);
        }
        match (self.prepare_timestamp, self.vote_abort_reason) {
            (_, Some(reason)) => Ok(Vote::Abort { reason }),
            (Some(prepare_timestamp), None) => Ok(Vote::Commit { prepare_timestamp }),
            (None, None) => Err(ParticipantError::MalformedReply {
                shard: shard.clone(),
                reason: "prepare reply carries neither prepareTimestamp nor abort vote"
                    .to_string(),
            }),
        }
    }

    /// Interpret a reply to `commitTransaction` / `abortTransaction`
    pub fn into_ack(self, shard: &ShardId) -> Result<(), ParticipantError> {
        match self.command_error(shard) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Commands a router or client sends to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum CoordinatorCommand {
    /// A statement inside a transaction; `startTransaction` opens a new txnNumber
    #[serde(rename_all = "camelCase")]
    TransactionStatement {
        lsid: SessionId,
        txn_number: TxnNumber,
        #[serde(default)]
        start_transaction: bool,
    },

    #[serde(rename_all = "camelCase")]
    CoordinateCommitTransaction {
        lsid: SessionId,
        txn_number: TxnNumber,
        participants: Vec<ShardId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_time_ms: Option<u64>,
    },

    #[serde(rename_all = "camelCase")]
    CommitTransaction {
        lsid: SessionId,
        txn_number: TxnNumber,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participants: Option<Vec<ShardId>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_time_ms: Option<u64>,
    },

    #[serde(rename_all = "camelCase")]
    AbortTransaction {
        lsid: SessionId,
        txn_number: TxnNumber,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_time_ms: Option<u64>,
    },
}

impl CoordinatorCommand {
    pub fn txn_id(&self) -> TransactionId {
        let (lsid, txn_number) = match self {
            CoordinatorCommand::TransactionStatement { lsid, txn_number, .. }
            | CoordinatorCommand::CoordinateCommitTransaction { lsid, txn_number, .. }
            | CoordinatorCommand::CommitTransaction { lsid, txn_number, .. }
            | CoordinatorCommand::AbortTransaction { lsid, txn_number, .. } => (lsid, txn_number),
        };
        TransactionId {
            session_id: *lsid,
            txn_number: *txn_number,
        }
    }
}

/// Outcome kind reported to routers/clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecisionKind {
    Commit,
    Abort,
}

/// Coordinator reply body
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_name: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

impl CoordinatorReply {
    pub fn ok() -> Self {
        CoordinatorReply {
            ok: true,
            ..Default::default()
        }
    }

    pub fn from_decision(decision: &Decision) -> Self {
        match decision {
            Decision::Commit { commit_timestamp } => CoordinatorReply {
                ok: true,
                decision: Some(DecisionKind::Commit),
                commit_timestamp: Some(*commit_timestamp),
                ..Default::default()
            },
            Decision::Abort { reason } => CoordinatorReply {
                ok: true,
                decision: Some(DecisionKind::Abort),
                abort_reason: Some(reason.clone()),
                ..Default::default()
            },
        }
    }

    pub fn from_error(err: &CoordinatorError) -> Self {
        CoordinatorReply {
            ok: false,
            code_name: Some(err.code()),
            errmsg: Some(err.to_string()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prepare_command_wire_shape() {
        let txn_id = TransactionId::new(SessionId::from_bytes([9u8; 16]), 4);
        let body = serde_json::to_value(ParticipantCommand::prepare(&txn_id)).unwrap();

        assert_eq!(body["command"], "prepareTransaction");
        assert_eq!(body["txnNumber"], 4);
        assert!(body.get("lsid").is_some());

        let decoded: ParticipantCommand = serde_json::from_value(body).unwrap();
        assert_eq!(decoded.txn_id(), txn_id);
    }

    #[test]
    fn test_commit_command_carries_commit_timestamp() {
        let txn_id = TransactionId::new(SessionId::from_bytes([9u8; 16]), 4);
        let body = serde_json::to_value(ParticipantCommand::commit(&txn_id, Timestamp(11))).unwrap();
        assert_eq!(body["command"], "commitTransaction");
        assert_eq!(body["commitTimestamp"], 11);
    }

    #[test]
    fn test_prepare_reply_decodes_votes_and_errors() {
        let shard = ShardId::new("s1");

        let commit: ParticipantReply =
            serde_json::from_value(json!({"ok": true, "prepareTimestamp": 12})).unwrap();
        assert_eq!(
            commit.into_vote(&shard),
            Ok(Vote::Commit { prepare_timestamp: Timestamp(12) })
        );

        let abort: ParticipantReply =
            serde_json::from_value(json!({"ok": true, "voteAbortReason": "conflict"})).unwrap();
        assert!(matches!(abort.into_vote(&shard), Ok(Vote::Abort { .. })));

        let err: ParticipantReply = serde_json::from_value(
            json!({"ok": false, "codeName": "StaleEpoch", "errmsg": "epoch changed"}),
        )
        .unwrap();
        assert_eq!(err.into_vote(&shard).unwrap_err().code(), Some(ErrorCode::StaleEpoch));

        let empty: ParticipantReply = serde_json::from_value(json!({"ok": true})).unwrap();
        assert!(matches!(
            empty.into_vote(&shard),
            Err(ParticipantError::MalformedReply { .. })
        ));
    }

    #[test]
    fn test_coordinate_commit_command_parses() {
        let body = json!({
            "command": "coordinateCommitTransaction",
            "lsid": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "txnNumber": 2,
            "participants": ["shardA", "shardB"]
        });
        let cmd: CoordinatorCommand = serde_json::from_value(body).unwrap();
        match cmd {
            CoordinatorCommand::CoordinateCommitTransaction { participants, max_time_ms, .. } => {
                assert_eq!(participants.len(), 2);
                assert_eq!(max_time_ms, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_coordinator_reply_from_decision() {
        let reply = CoordinatorReply::from_decision(&Decision::Commit {
            commit_timestamp: Timestamp(7),
        });
        let body = serde_json::to_value(&reply).unwrap();
        assert_eq!(body, json!({"ok": true, "decision": "commit", "commitTimestamp": 7}));
    }
}
