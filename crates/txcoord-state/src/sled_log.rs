// CROSS-SHARD COMMIT COORDINATION
// Sled Decision Log - single-node durable coordinator documents
//
// SAFETY INVARIANTS:
// 1. Every mutation is a read-modify-write under one lock
// 2. "Majority committed" means flushed to disk on this node
// 3. The term is bumped each time the database is opened
// 4. A session outcome is stored before its document is removed

use crate::decision_log::{apply_decision, DecisionLog, OpTime, SessionOutcome};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use txcoord_core::{
    CoordinatorDocument, Decision, DecisionLogError, LogResult, ParticipantList, SessionId,
    ShardId, Timestamp, TransactionId, TxnNumber,
};

const DOCUMENTS_TREE: &str = "coordinator_documents";
const META_TREE: &str = "coordinator_meta";
const SESSIONS_TREE: &str = "session_outcomes";
const TERM_KEY: &[u8] = b"term";
const STEPUP_KEY: &[u8] = b"last_noop";

/// On-disk decision encoding (bincode needs an externally tagged enum)
#[derive(Debug, Clone, Serialize, Deserialize)]
enum StoredDecision {
    Commit(u64),
    Abort(String),
}

impl From<&Decision> for StoredDecision {
    fn from(decision: &Decision) -> Self {
        match decision {
            Decision::Commit { commit_timestamp } => StoredDecision::Commit(commit_timestamp.0),
            Decision::Abort { reason } => StoredDecision::Abort(reason.clone()),
        }
    }
}

impl From<StoredDecision> for Decision {
    fn from(stored: StoredDecision) -> Self {
        match stored {
            StoredDecision::Commit(ts) => Decision::Commit {
                commit_timestamp: Timestamp(ts),
            },
            StoredDecision::Abort(reason) => Decision::Abort { reason },
        }
    }
}

/// On-disk session outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredOutcome {
    txn_number: u64,
    decision: StoredDecision,
}

/// On-disk coordinator document
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    txn_id: TransactionId,
    participants: Vec<ShardId>,
    decision: Option<StoredDecision>,
    acknowledged: Vec<ShardId>,
}

impl From<&CoordinatorDocument> for StoredDocument {
    fn from(doc: &CoordinatorDocument) -> Self {
        StoredDocument {
            txn_id: doc.txn_id,
            participants: doc.participants.shards().to_vec(),
            decision: doc.decision.as_ref().map(StoredDecision::from),
            acknowledged: doc.acknowledged.iter().cloned().collect(),
        }
    }
}

impl TryFrom<StoredDocument> for CoordinatorDocument {
    type Error = DecisionLogError;

    fn try_from(stored: StoredDocument) -> Result<Self, Self::Error> {
        let participants = ParticipantList::new(stored.participants)
            .map_err(|e| DecisionLogError::Codec(e.to_string()))?;
        Ok(CoordinatorDocument {
            txn_id: stored.txn_id,
            participants,
            decision: stored.decision.map(Decision::from),
            acknowledged: stored.acknowledged.into_iter().collect::<BTreeSet<_>>(),
        })
    }
}

fn storage_err(err: sled::Error) -> DecisionLogError {
    DecisionLogError::Storage(err.to_string())
}

fn encode(doc: &CoordinatorDocument) -> LogResult<Vec<u8>> {
    bincode::serialize(&StoredDocument::from(doc)).map_err(|e| DecisionLogError::Codec(e.to_string()))
}

fn decode(bytes: &[u8]) -> LogResult<CoordinatorDocument> {
    let stored: StoredDocument =
        bincode::deserialize(bytes).map_err(|e| DecisionLogError::Codec(e.to_string()))?;
    stored.try_into()
}

fn decode_outcome(bytes: &[u8]) -> LogResult<SessionOutcome> {
    let stored: StoredOutcome =
        bincode::deserialize(bytes).map_err(|e| DecisionLogError::Codec(e.to_string()))?;
    Ok(SessionOutcome {
        txn_number: TxnNumber(stored.txn_number),
        decision: stored.decision.into(),
    })
}

/// Decision log persisted in a local sled database
pub struct SledDecisionLog {
    db: sled::Db,
    documents: sled::Tree,
    meta: sled::Tree,
    sessions: sled::Tree,
    term: u64,
    write_lock: Mutex<()>,
}

impl SledDecisionLog {
    /// Open (or create) the log at `path` and take the next term
    pub fn open(path: impl AsRef<Path>) -> LogResult<Self> {
        let db = sled::open(path.as_ref()).map_err(storage_err)?;
        Self::from_db(db)
    }

    /// Throwaway log removed when dropped
    pub fn temporary() -> LogResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage_err)?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> LogResult<Self> {
        let documents = db.open_tree(DOCUMENTS_TREE).map_err(storage_err)?;
        let meta = db.open_tree(META_TREE).map_err(storage_err)?;
        let sessions = db.open_tree(SESSIONS_TREE).map_err(storage_err)?;

        let previous = meta
            .get(TERM_KEY)
            .map_err(storage_err)?
            .map(|bytes| bincode::deserialize::<u64>(&bytes))
            .transpose()
            .map_err(|e| DecisionLogError::Codec(e.to_string()))?
            .unwrap_or(0);
        let term = previous + 1;
        let encoded = bincode::serialize(&term).map_err(|e| DecisionLogError::Codec(e.to_string()))?;
        meta.insert(TERM_KEY, encoded).map_err(storage_err)?;
        db.flush().map_err(storage_err)?;

        info!(
            "opened sled decision log at term {} with {} coordinator documents",
            term,
            documents.len()
        );
        Ok(SledDecisionLog {
            db,
            documents,
            meta,
            sessions,
            term,
            write_lock: Mutex::new(()),
        })
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    fn next_op_time(&self) -> LogResult<OpTime> {
        let index = self.db.generate_id().map_err(storage_err)?;
        Ok(OpTime {
            term: self.term,
            index,
        })
    }

    fn load(&self, txn_id: &TransactionId) -> LogResult<Option<CoordinatorDocument>> {
        self.documents
            .get(txn_id.storage_key())
            .map_err(storage_err)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn load_outcome(&self, session_id: &SessionId) -> LogResult<Option<SessionOutcome>> {
        self.sessions
            .get(session_id.as_bytes())
            .map_err(storage_err)?
            .map(|bytes| decode_outcome(&bytes))
            .transpose()
    }

    fn store(&self, doc: &CoordinatorDocument) -> LogResult<()> {
        self.documents
            .insert(doc.txn_id.storage_key(), encode(doc)?)
            .map_err(storage_err)?;
        Ok(())
    }

    fn update<R>(
        &self,
        txn_id: &TransactionId,
        apply: impl FnOnce(&mut CoordinatorDocument) -> LogResult<R>,
    ) -> LogResult<(R, OpTime)> {
        let _guard = self.write_lock.lock();
        let mut doc = self
            .load(txn_id)?
            .ok_or(DecisionLogError::DocumentNotFound { txn_id: *txn_id })?;
        let result = apply(&mut doc)?;
        self.store(&doc)?;
        Ok((result, self.next_op_time()?))
    }
}

#[async_trait]
impl DecisionLog for SledDecisionLog {
    async fn write_participant_list(
        &self,
        txn_id: &TransactionId,
        participants: &ParticipantList,
    ) -> LogResult<OpTime> {
        let _guard = self.write_lock.lock();
        match self.load(txn_id)? {
            Some(existing) if !existing.participants.same_members(participants) => {
                return Err(DecisionLogError::ParticipantListConflict { txn_id: *txn_id });
            }
            Some(_) => {}
            None => self.store(&CoordinatorDocument::new(*txn_id, participants.clone()))?,
        }
        self.next_op_time()
    }

    async fn write_decision(
        &self,
        txn_id: &TransactionId,
        decision: &Decision,
        already_acknowledged: &BTreeSet<ShardId>,
    ) -> LogResult<(Decision, OpTime)> {
        self.update(txn_id, |doc| apply_decision(doc, decision, already_acknowledged))
    }

    async fn record_acknowledgement(&self, txn_id: &TransactionId, shard: &ShardId) -> LogResult<OpTime> {
        let ((), op_time) = self.update(txn_id, |doc| {
            doc.acknowledged.insert(shard.clone());
            Ok(())
        })?;
        Ok(op_time)
    }

    async fn delete_document(&self, txn_id: &TransactionId) -> LogResult<OpTime> {
        let _guard = self.write_lock.lock();
        if let Some(decision) = self.load(txn_id)?.and_then(|doc| doc.decision) {
            let outcome = SessionOutcome {
                txn_number: txn_id.txn_number,
                decision,
            };
            if outcome.supersedes(self.load_outcome(&txn_id.session_id)?.as_ref()) {
                let stored = StoredOutcome {
                    txn_number: outcome.txn_number.0,
                    decision: StoredDecision::from(&outcome.decision),
                };
                let encoded =
                    bincode::serialize(&stored).map_err(|e| DecisionLogError::Codec(e.to_string()))?;
                self.sessions
                    .insert(txn_id.session_id.as_bytes(), encoded)
                    .map_err(storage_err)?;
            }
        }
        self.documents
            .remove(txn_id.storage_key())
            .map_err(storage_err)?;
        self.next_op_time()
    }

    async fn read_session_outcome(&self, session_id: &SessionId) -> LogResult<Option<SessionOutcome>> {
        self.load_outcome(session_id)
    }

    async fn read_document(&self, txn_id: &TransactionId) -> LogResult<Option<CoordinatorDocument>> {
        self.load(txn_id)
    }

    async fn scan_unfinished(&self) -> LogResult<Vec<CoordinatorDocument>> {
        self.documents
            .iter()
            .values()
            .map(|value| decode(&value.map_err(storage_err)?))
            .collect()
    }

    async fn write_noop(&self, message: &str) -> LogResult<OpTime> {
        let _guard = self.write_lock.lock();
        self.meta
            .insert(STEPUP_KEY, message.as_bytes())
            .map_err(storage_err)?;
        self.next_op_time()
    }

    async fn wait_for_majority(&self, op_time: OpTime) -> LogResult<()> {
        let flushed = self.db.flush_async().await.map_err(storage_err)?;
        debug!("flushed {} bytes for {}", flushed, op_time);
        Ok(())
    }
}
