// CROSS-SHARD COMMIT COORDINATION
// Decision Log - durable per-transaction coordinator documents
//
// SAFETY INVARIANTS:
// 1. A document exists (decision unset) before any prepare is sent
// 2. The decision field is written once; a different decision is rejected
// 3. Callers wait for majority acknowledgement of the returned OpTime before acting
// 4. Writes from a deposed primary (stale term) are rejected
// 5. A document is deleted only after every participant acknowledged
// 6. Deleting a decided document records it as its session's outcome

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use txcoord_core::{
    CoordinatorDocument, Decision, DecisionLogError, LogResult, ParticipantList, SessionId,
    ShardId, TransactionId, TxnNumber,
};

/// Position of a write in the coordinator replica set's log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpTime {
    pub term: u64,
    pub index: u64,
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{t:{}, i:{}}}", self.term, self.index)
    }
}

/// Decision of the newest finished transaction on a session
///
/// Outlives the coordinator document so a retried commit after failover
/// observes the original decision instead of running prepare again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub txn_number: TxnNumber,
    pub decision: Decision,
}

impl SessionOutcome {
    /// Keep the outcome with the higher txnNumber
    pub(crate) fn supersedes(&self, existing: Option<&SessionOutcome>) -> bool {
        existing.map_or(true, |existing| self.txn_number >= existing.txn_number)
    }
}

/// Durable key-value store of coordinator documents with a majority-acknowledged write primitive
#[async_trait]
pub trait DecisionLog: Send + Sync {
    /// Insert the document with no decision; idempotent for an identical participant list
    async fn write_participant_list(
        &self,
        txn_id: &TransactionId,
        participants: &ParticipantList,
    ) -> LogResult<OpTime>;

    /// Write the decision once. Returns the persisted decision: the existing one
    /// when an identical decision was already written.
    ///
    /// `already_acknowledged` seeds the acknowledgement set (abort voters).
    async fn write_decision(
        &self,
        txn_id: &TransactionId,
        decision: &Decision,
        already_acknowledged: &BTreeSet<ShardId>,
    ) -> LogResult<(Decision, OpTime)>;

    async fn record_acknowledgement(&self, txn_id: &TransactionId, shard: &ShardId) -> LogResult<OpTime>;

    /// Remove the document; a decided one becomes its session's outcome
    async fn delete_document(&self, txn_id: &TransactionId) -> LogResult<OpTime>;

    /// Outcome of the newest finished transaction on `session_id`
    async fn read_session_outcome(&self, session_id: &SessionId) -> LogResult<Option<SessionOutcome>>;

    async fn read_document(&self, txn_id: &TransactionId) -> LogResult<Option<CoordinatorDocument>>;

    /// Every document not yet deleted
    async fn scan_unfinished(&self) -> LogResult<Vec<CoordinatorDocument>>;

    /// No-op write witnessing this node's promotion
    async fn write_noop(&self, message: &str) -> LogResult<OpTime>;

    /// Resolve once the write at `op_time` is majority-committed
    async fn wait_for_majority(&self, op_time: OpTime) -> LogResult<()>;
}

/// Apply the decision write-once rule to a document
pub(crate) fn apply_decision(
    doc: &mut CoordinatorDocument,
    decision: &Decision,
    already_acknowledged: &BTreeSet<ShardId>,
) -> LogResult<Decision> {
    match &doc.decision {
        Some(existing) if existing == decision => Ok(existing.clone()),
        Some(existing) => Err(DecisionLogError::DecisionConflict {
            txn_id: doc.txn_id,
            existing: existing.clone(),
            attempted: decision.clone(),
        }),
        None => {
            doc.decision = Some(decision.clone());
            doc.acknowledged.extend(
                already_acknowledged
                    .iter()
                    .filter(|shard| doc.participants.contains(shard))
                    .cloned(),
            );
            Ok(decision.clone())
        }
    }
}

/// Kinds of entries recorded in the in-memory oplog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    ParticipantList(TransactionId),
    Decision(TransactionId, Decision),
    Acknowledgement(TransactionId, ShardId),
    Delete(TransactionId),
    Noop(String),
}

#[derive(Debug)]
struct ReplicaState {
    term: u64,
    last_index: u64,
    majority_index: u64,
    auto_majority: bool,
    documents: BTreeMap<TransactionId, CoordinatorDocument>,
    /// Decision writes with their index, kept after deletion
    decisions: BTreeMap<TransactionId, Vec<(Decision, u64)>>,
    session_outcomes: BTreeMap<SessionId, SessionOutcome>,
    oplog: Vec<(OpTime, LogEntry)>,
}

/// In-memory model of the coordinator's replica set
///
/// Documents survive node failover because every elected primary shares this
/// state. The majority-commit point either follows every write (default) or
/// is advanced explicitly by tests.
#[derive(Debug)]
pub struct InMemoryReplicaSet {
    state: Mutex<ReplicaState>,
    majority: watch::Sender<u64>,
}

impl InMemoryReplicaSet {
    pub fn new() -> Arc<Self> {
        let (majority, _) = watch::channel(0);
        Arc::new(InMemoryReplicaSet {
            state: Mutex::new(ReplicaState {
                term: 0,
                last_index: 0,
                majority_index: 0,
                auto_majority: true,
                documents: BTreeMap::new(),
                decisions: BTreeMap::new(),
                session_outcomes: BTreeMap::new(),
                oplog: Vec::new(),
            }),
            majority,
        })
    }

    /// Elect a new primary; the returned handle writes at the new term
    pub fn elect_primary(self: &Arc<Self>) -> InMemoryDecisionLog {
        let mut state = self.state.lock();
        state.term += 1;
        info!("replica set elected a new primary at term {}", state.term);
        InMemoryDecisionLog {
            set: self.clone(),
            term: state.term,
        }
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().term
    }

    /// Hold the majority point in place until `advance_majority` is called
    pub fn set_auto_majority(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.auto_majority = enabled;
        if enabled {
            state.majority_index = state.last_index;
            self.majority.send_replace(state.majority_index);
        }
    }

    /// Majority-commit everything written so far
    pub fn advance_majority(&self) {
        let mut state = self.state.lock();
        state.majority_index = state.last_index;
        debug!("majority point advanced to {}", state.majority_index);
        self.majority.send_replace(state.majority_index);
    }

    pub fn majority_index(&self) -> u64 {
        self.state.lock().majority_index
    }

    pub fn last_index(&self) -> u64 {
        self.state.lock().last_index
    }

    pub fn document(&self, txn_id: &TransactionId) -> Option<CoordinatorDocument> {
        self.state.lock().documents.get(txn_id).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.state.lock().documents.len()
    }

    /// Every decision ever written for `txn_id`, oldest first
    pub fn decisions_written(&self, txn_id: &TransactionId) -> Vec<Decision> {
        self.state
            .lock()
            .decisions
            .get(txn_id)
            .map(|writes| writes.iter().map(|(d, _)| d.clone()).collect())
            .unwrap_or_default()
    }

    /// The decision for `txn_id` if its write is majority-committed
    pub fn majority_committed_decision(&self, txn_id: &TransactionId) -> Option<Decision> {
        let state = self.state.lock();
        state.decisions.get(txn_id).and_then(|writes| {
            writes
                .first()
                .filter(|(_, index)| *index <= state.majority_index)
                .map(|(decision, _)| decision.clone())
        })
    }

    pub fn oplog(&self) -> Vec<(OpTime, LogEntry)> {
        self.state.lock().oplog.clone()
    }

    fn write<R>(
        &self,
        term: u64,
        apply: impl FnOnce(&mut ReplicaState) -> LogResult<(R, LogEntry)>,
    ) -> LogResult<(R, OpTime)> {
        let mut state = self.state.lock();
        if state.term != term {
            return Err(DecisionLogError::NotPrimary { term });
        }

        let (result, entry) = apply(&mut state)?;
        state.last_index += 1;
        let op_time = OpTime {
            term,
            index: state.last_index,
        };
        if let LogEntry::Decision(txn_id, decision) = &entry {
            state
                .decisions
                .entry(*txn_id)
                .or_default()
                .push((decision.clone(), op_time.index));
        }
        state.oplog.push((op_time, entry));

        if state.auto_majority {
            state.majority_index = state.last_index;
            self.majority.send_replace(state.majority_index);
        }
        Ok((result, op_time))
    }
}

/// A primary's handle on the in-memory replica set
#[derive(Debug, Clone)]
pub struct InMemoryDecisionLog {
    set: Arc<InMemoryReplicaSet>,
    term: u64,
}

impl InMemoryDecisionLog {
    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn replica_set(&self) -> &Arc<InMemoryReplicaSet> {
        &self.set
    }
}

#[async_trait]
impl DecisionLog for InMemoryDecisionLog {
    async fn write_participant_list(
        &self,
        txn_id: &TransactionId,
        participants: &ParticipantList,
    ) -> LogResult<OpTime> {
        let ((), op_time) = self.set.write(self.term, |state| {
            if let Some(existing) = state.documents.get(txn_id) {
                if !existing.participants.same_members(participants) {
                    return Err(DecisionLogError::ParticipantListConflict { txn_id: *txn_id });
                }
            } else {
                state.documents.insert(
                    *txn_id,
                    CoordinatorDocument::new(*txn_id, participants.clone()),
                );
            }
            Ok(((), LogEntry::ParticipantList(*txn_id)))
        })?;
        Ok(op_time)
    }

    async fn write_decision(
        &self,
        txn_id: &TransactionId,
        decision: &Decision,
        already_acknowledged: &BTreeSet<ShardId>,
    ) -> LogResult<(Decision, OpTime)> {
        let result = self.set.write(self.term, |state| {
            let doc = state
                .documents
                .get_mut(txn_id)
                .ok_or(DecisionLogError::DocumentNotFound { txn_id: *txn_id })?;
            let previously_set = doc.decision.is_some();
            let persisted = apply_decision(doc, decision, already_acknowledged)?;
            let entry = if previously_set {
                LogEntry::Noop(format!("decision for {} already persisted", txn_id))
            } else {
                LogEntry::Decision(*txn_id, persisted.clone())
            };
            Ok((persisted, entry))
        });
        if let Err(DecisionLogError::DecisionConflict { .. }) = &result {
            warn!("refused conflicting decision for {}", txn_id);
        }
        result
    }

    async fn record_acknowledgement(&self, txn_id: &TransactionId, shard: &ShardId) -> LogResult<OpTime> {
        let ((), op_time) = self.set.write(self.term, |state| {
            let doc = state
                .documents
                .get_mut(txn_id)
                .ok_or(DecisionLogError::DocumentNotFound { txn_id: *txn_id })?;
            doc.acknowledged.insert(shard.clone());
            Ok(((), LogEntry::Acknowledgement(*txn_id, shard.clone())))
        })?;
        Ok(op_time)
    }

    async fn delete_document(&self, txn_id: &TransactionId) -> LogResult<OpTime> {
        let ((), op_time) = self.set.write(self.term, |state| {
            let decided = state.documents.remove(txn_id).and_then(|doc| doc.decision);
            if let Some(decision) = decided {
                let outcome = SessionOutcome {
                    txn_number: txn_id.txn_number,
                    decision,
                };
                if outcome.supersedes(state.session_outcomes.get(&txn_id.session_id)) {
                    state.session_outcomes.insert(txn_id.session_id, outcome);
                }
            }
            Ok(((), LogEntry::Delete(*txn_id)))
        })?;
        Ok(op_time)
    }

    async fn read_session_outcome(&self, session_id: &SessionId) -> LogResult<Option<SessionOutcome>> {
        Ok(self.set.state.lock().session_outcomes.get(session_id).cloned())
    }

    async fn read_document(&self, txn_id: &TransactionId) -> LogResult<Option<CoordinatorDocument>> {
        Ok(self.set.document(txn_id))
    }

    async fn scan_unfinished(&self) -> LogResult<Vec<CoordinatorDocument>> {
        Ok(self.set.state.lock().documents.values().cloned().collect())
    }

    async fn write_noop(&self, message: &str) -> LogResult<OpTime> {
        let ((), op_time) = self
            .set
            .write(self.term, |_| Ok(((), LogEntry::Noop(message.to_string()))))?;
        Ok(op_time)
    }

    async fn wait_for_majority(&self, op_time: OpTime) -> LogResult<()> {
        let mut majority = self.set.majority.subscribe();
        majority
            .wait_for(|index| *index >= op_time.index)
            .await
            .map_err(|_| DecisionLogError::Storage("replica set shut down".to_string()))?;
        Ok(())
    }
}

/// Decision log wrapper that fails scripted decision writes
#[cfg(test)]
pub(crate) struct FaultyDecisionLog {
    pub inner: InMemoryDecisionLog,
    pub decision_failures: Mutex<Vec<DecisionLogError>>,
}

#[cfg(test)]
impl FaultyDecisionLog {
    pub fn new(inner: InMemoryDecisionLog, failures: Vec<DecisionLogError>) -> Self {
        FaultyDecisionLog {
            inner,
            decision_failures: Mutex::new(failures),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl DecisionLog for FaultyDecisionLog {
    async fn write_participant_list(
        &self,
        txn_id: &TransactionId,
        participants: &ParticipantList,
    ) -> LogResult<OpTime> {
        self.inner.write_participant_list(txn_id, participants).await
    }

    async fn write_decision(
        &self,
        txn_id: &TransactionId,
        decision: &Decision,
        already_acknowledged: &BTreeSet<ShardId>,
    ) -> LogResult<(Decision, OpTime)> {
        let failure = {
            let mut failures = self.decision_failures.lock();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };
        match failure {
            Some(err) => Err(err),
            None => self.inner.write_decision(txn_id, decision, already_acknowledged).await,
        }
    }

    async fn record_acknowledgement(&self, txn_id: &TransactionId, shard: &ShardId) -> LogResult<OpTime> {
        self.inner.record_acknowledgement(txn_id, shard).await
    }

    async fn delete_document(&self, txn_id: &TransactionId) -> LogResult<OpTime> {
        self.inner.delete_document(txn_id).await
    }

    async fn read_session_outcome(&self, session_id: &SessionId) -> LogResult<Option<SessionOutcome>> {
        self.inner.read_session_outcome(session_id).await
    }

    async fn read_document(&self, txn_id: &TransactionId) -> LogResult<Option<CoordinatorDocument>> {
        self.inner.read_document(txn_id).await
    }

    async fn scan_unfinished(&self) -> LogResult<Vec<CoordinatorDocument>> {
        self.inner.scan_unfinished().await
    }

    async fn write_noop(&self, message: &str) -> LogResult<OpTime> {
        self.inner.write_noop(message).await
    }

    async fn wait_for_majority(&self, op_time: OpTime) -> LogResult<()> {
        self.inner.wait_for_majority(op_time).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use txcoord_core::{SessionId, Timestamp};

    fn txn(n: u64) -> TransactionId {
        TransactionId::new(SessionId::from_bytes([1u8; 16]), n)
    }

    fn participants() -> ParticipantList {
        ParticipantList::new(vec![ShardId::new("s1"), ShardId::new("s2")]).unwrap()
    }

    #[tokio::test]
    async fn test_decision_is_write_once() {
        let set = InMemoryReplicaSet::new();
        let log = set.elect_primary();
        log.write_participant_list(&txn(1), &participants()).await.unwrap();

        let commit = Decision::Commit { commit_timestamp: Timestamp(10) };
        let (persisted, _) = log.write_decision(&txn(1), &commit, &BTreeSet::new()).await.unwrap();
        assert_eq!(persisted, commit);

        // Same decision again is accepted and returns the original
        let (again, _) = log.write_decision(&txn(1), &commit, &BTreeSet::new()).await.unwrap();
        assert_eq!(again, commit);

        // A different decision is refused
        let err = log
            .write_decision(&txn(1), &Decision::abort("late"), &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DecisionLogError::DecisionConflict { .. }));
        assert_eq!(set.decisions_written(&txn(1)), vec![commit]);
    }

    #[tokio::test]
    async fn test_deposed_primary_cannot_write() {
        let set = InMemoryReplicaSet::new();
        let old = set.elect_primary();
        let new = set.elect_primary();

        let err = old.write_participant_list(&txn(1), &participants()).await.unwrap_err();
        assert_eq!(err, DecisionLogError::NotPrimary { term: 1 });
        assert!(new.write_participant_list(&txn(1), &participants()).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_majority_blocks_until_advanced() {
        let set = InMemoryReplicaSet::new();
        set.set_auto_majority(false);
        let log = set.elect_primary();

        let op_time = log.write_noop("stepup").await.unwrap();
        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.wait_for_majority(op_time).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        set.advance_majority();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_abort_voters_seed_acknowledgements() {
        let set = InMemoryReplicaSet::new();
        let log = set.elect_primary();
        log.write_participant_list(&txn(2), &participants()).await.unwrap();

        let voters: BTreeSet<_> = [ShardId::new("s2"), ShardId::new("unknown")].into_iter().collect();
        log.write_decision(&txn(2), &Decision::abort("s2 voted abort"), &voters)
            .await
            .unwrap();

        let doc = set.document(&txn(2)).unwrap();
        assert_eq!(doc.unacknowledged(), vec![ShardId::new("s1")]);
        assert!(!doc.acknowledged.contains(&ShardId::new("unknown")));
    }

    #[tokio::test]
    async fn test_participant_list_conflict() {
        let set = InMemoryReplicaSet::new();
        let log = set.elect_primary();
        log.write_participant_list(&txn(3), &participants()).await.unwrap();

        let other = ParticipantList::new(vec![ShardId::new("s9")]).unwrap();
        let err = log.write_participant_list(&txn(3), &other).await.unwrap_err();
        assert!(matches!(err, DecisionLogError::ParticipantListConflict { .. }));
    }

    #[tokio::test]
    async fn test_majority_committed_decision_respects_majority_point() {
        let set = InMemoryReplicaSet::new();
        let log = set.elect_primary();
        log.write_participant_list(&txn(4), &participants()).await.unwrap();

        set.set_auto_majority(false);
        log.write_decision(&txn(4), &Decision::abort("x"), &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(set.majority_committed_decision(&txn(4)), None);

        set.advance_majority();
        assert_eq!(set.majority_committed_decision(&txn(4)), Some(Decision::abort("x")));
    }

    #[tokio::test]
    async fn test_deleting_decided_document_records_session_outcome() {
        let set = InMemoryReplicaSet::new();
        let log = set.elect_primary();
        let commit = Decision::Commit { commit_timestamp: Timestamp(8) };
        log.write_participant_list(&txn(6), &participants()).await.unwrap();
        log.write_decision(&txn(6), &commit, &BTreeSet::new()).await.unwrap();
        log.delete_document(&txn(6)).await.unwrap();

        // An older transaction finishing later does not replace the outcome
        log.write_participant_list(&txn(5), &participants()).await.unwrap();
        log.write_decision(&txn(5), &Decision::abort("x"), &BTreeSet::new())
            .await
            .unwrap();
        log.delete_document(&txn(5)).await.unwrap();

        // Survives a change of primary
        let next = set.elect_primary();
        let outcome = next.read_session_outcome(&txn(6).session_id).await.unwrap();
        assert_eq!(
            outcome,
            Some(SessionOutcome {
                txn_number: TxnNumber(6),
                decision: commit,
            })
        );
    }

    #[tokio::test]
    async fn test_deleting_undecided_document_records_nothing() {
        let set = InMemoryReplicaSet::new();
        let log = set.elect_primary();
        log.write_participant_list(&txn(7), &participants()).await.unwrap();
        log.delete_document(&txn(7)).await.unwrap();
        assert_eq!(log.read_session_outcome(&txn(7).session_id).await.unwrap(), None);
    }
}
