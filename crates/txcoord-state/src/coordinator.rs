// CROSS-SHARD COMMIT COORDINATION
// Coordinator Instance - per-transaction two-phase commit state machine
//
// SAFETY INVARIANTS:
// 1. The coordinator document exists before the first prepare is sent
// 2. Only kPreparing may produce a new decision; later states replay it
// 3. The decision is majority-durable before any commit/abort is sent
// 4. Delivery retries every error until each participant acknowledges
// 5. The document is deleted only after every participant acknowledged
// 6. Step-down stops the instance without touching its persisted state
// 7. A participant reporting the transaction committed never leads to an abort

use crate::decision_log::DecisionLog;
use crate::participant_client::{Backoff, ParticipantClient};
use futures::future::try_join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use txcoord_core::{
    decide, CoordinatorConfig, CoordinatorDocument, CoordinatorError, CoordinatorResult,
    Decision, DecisionLogError, ErrorClass, ErrorCode, LogResult, ParticipantError,
    ParticipantList, ShardId, TransactionId, Vote,
};

/// Coordinator lifecycle states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum CoordinatorState {
    Init,
    Preparing,
    MakingDecision,
    Committing,
    Aborting,
    Deleting,
    Done,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorState::Init => "kInit",
            CoordinatorState::Preparing => "kPreparing",
            CoordinatorState::MakingDecision => "kMakingDecision",
            CoordinatorState::Committing => "kCommitting",
            CoordinatorState::Aborting => "kAborting",
            CoordinatorState::Deleting => "kDeleting",
            CoordinatorState::Done => "kDone",
        };
        f.write_str(name)
    }
}

/// Collaborators shared by every coordinator of one primary term
pub struct CoordinatorDeps {
    pub log: Arc<dyn DecisionLog>,
    pub client: Arc<dyn ParticipantClient>,
    pub config: CoordinatorConfig,
    deposed: CancellationToken,
}

impl CoordinatorDeps {
    pub fn new(
        log: Arc<dyn DecisionLog>,
        client: Arc<dyn ParticipantClient>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(CoordinatorDeps {
            log,
            client,
            config,
            deposed: CancellationToken::new(),
        })
    }

    /// Cancelled when the decision log rejects a write because this term is over
    pub fn deposed(&self) -> &CancellationToken {
        &self.deposed
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.backoff_initial(), self.config.backoff_max())
    }
}

/// Where a coordinator picks up
#[derive(Debug, Clone)]
pub enum StartPoint {
    /// New transaction: persist the participant list, then prepare
    Fresh,
    /// Found by step-up recovery
    Recovered(CoordinatorDocument),
}

/// Observable progress, published on every transition
#[derive(Debug, Clone)]
pub struct CoordinatorProgress {
    pub state: CoordinatorState,
    /// Set only once the decision is majority-durable
    pub decision: Option<Decision>,
    pub acknowledged: usize,
    /// Why the coordinator stopped before kDone
    pub failed: Option<CoordinatorError>,
    pub abort_requested: bool,
}

/// Admin view of one in-flight coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorReport {
    pub txn_id: TransactionId,
    pub participants: Vec<ShardId>,
    pub state: CoordinatorState,
    pub decision: Option<Decision>,
    pub acknowledged: usize,
    pub recovered: bool,
    pub abort_requested: bool,
}

/// Two-phase commit driver for one transaction
///
/// SAFETY: Exactly one instance exists per TransactionId; the catalog enforces it.
pub struct CoordinatorInstance {
    txn_id: TransactionId,
    participants: ParticipantList,
    start: StartPoint,
    deps: Arc<CoordinatorDeps>,
    progress: watch::Sender<CoordinatorProgress>,
    abort_requested: CancellationToken,
    shutdown: CancellationToken,
}

impl CoordinatorInstance {
    pub fn new(
        txn_id: TransactionId,
        participants: ParticipantList,
        start: StartPoint,
        deps: Arc<CoordinatorDeps>,
        shutdown: CancellationToken,
    ) -> Self {
        let (progress, _) = watch::channel(CoordinatorProgress {
            state: CoordinatorState::Init,
            decision: None,
            acknowledged: 0,
            failed: None,
            abort_requested: false,
        });
        CoordinatorInstance {
            txn_id,
            participants,
            start,
            deps,
            progress,
            abort_requested: CancellationToken::new(),
            shutdown,
        }
    }

    pub fn txn_id(&self) -> &TransactionId {
        &self.txn_id
    }

    pub fn participants(&self) -> &ParticipantList {
        &self.participants
    }

    pub fn progress(&self) -> CoordinatorProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorProgress> {
        self.progress.subscribe()
    }

    /// Drive the transaction to kDone, or stop when interrupted
    pub async fn run(&self) -> CoordinatorResult<Decision> {
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(CoordinatorError::Interrupted {
                txn_id: self.txn_id,
                reason: "coordinator stepped down".to_string(),
            }),
            result = self.drive() => result,
        };

        match &result {
            Ok(decision) => info!("coordinator {} finished with {}", self.txn_id, decision),
            Err(err) => {
                warn!(
                    "coordinator {} stopped in {}: {}",
                    self.txn_id,
                    self.progress.borrow().state,
                    err
                );
                self.progress
                    .send_modify(|p| p.failed = Some(err.clone()));
            }
        }
        result
    }

    /// Ask the coordinator to abort.
    ///
    /// Returns true when the request will decide the transaction: the
    /// coordinator has not left kPreparing yet. Once it has, the decision it
    /// reaches (or already made durable) stands.
    pub fn request_abort(&self) -> bool {
        let mut accepted = false;
        self.progress.send_modify(|p| {
            p.abort_requested = true;
            accepted = p.state <= CoordinatorState::Preparing && p.decision.is_none();
        });
        self.abort_requested.cancel();
        accepted
    }

    /// Stop this coordinator without deciding; persisted state is left for recovery
    pub fn interrupt(&self) {
        self.shutdown.cancel();
    }

    /// Resolve once the decision is durable
    pub async fn wait_for_decision(&self) -> CoordinatorResult<Decision> {
        let mut progress = self.progress.subscribe();
        let seen = progress
            .wait_for(|p| p.decision.is_some() || p.failed.is_some())
            .await
            .map(|p| (p.decision.clone(), p.failed.clone()))
            .map_err(|_| self.interrupted_error("coordinator dropped"))?;
        match seen {
            (Some(decision), _) => Ok(decision),
            (None, failed) => Err(failed.unwrap_or_else(|| self.interrupted_error("interrupted"))),
        }
    }

    /// Resolve once every participant acknowledged and the document is gone
    pub async fn wait_for_completion(&self) -> CoordinatorResult<Decision> {
        let mut progress = self.progress.subscribe();
        let seen = progress
            .wait_for(|p| p.state == CoordinatorState::Done || p.failed.is_some())
            .await
            .map(|p| (p.state, p.decision.clone(), p.failed.clone()))
            .map_err(|_| self.interrupted_error("coordinator dropped"))?;
        match seen {
            (CoordinatorState::Done, Some(decision), _) => Ok(decision),
            (_, _, failed) => Err(failed.unwrap_or_else(|| self.interrupted_error("interrupted"))),
        }
    }

    pub fn report(&self) -> CoordinatorReport {
        let progress = self.progress.borrow();
        CoordinatorReport {
            txn_id: self.txn_id,
            participants: self.participants.shards().to_vec(),
            state: progress.state,
            decision: progress.decision.clone(),
            acknowledged: progress.acknowledged,
            recovered: matches!(self.start, StartPoint::Recovered(_)),
            abort_requested: self.abort_requested.is_cancelled(),
        }
    }

    fn interrupted_error(&self, reason: &str) -> CoordinatorError {
        CoordinatorError::Interrupted {
            txn_id: self.txn_id,
            reason: reason.to_string(),
        }
    }

    fn transition(&self, next: CoordinatorState) {
        let previous = self.progress.borrow().state;
        info!("coordinator {}: {} -> {}", self.txn_id, previous, next);
        self.progress.send_modify(|p| p.state = next);
    }

    async fn drive(&self) -> CoordinatorResult<Decision> {
        let log = &self.deps.log;

        let (decision, pending) = match &self.start {
            StartPoint::Fresh => {
                let op_time = self
                    .log_op("participant list", || {
                        log.write_participant_list(&self.txn_id, &self.participants)
                    })
                    .await?;
                self.log_op("participant list majority", || log.wait_for_majority(op_time))
                    .await?;
                self.prepare_and_decide().await?
            }
            StartPoint::Recovered(doc) => match &doc.decision {
                None => {
                    info!("recovered {} without a decision; restarting prepare", self.txn_id);
                    self.prepare_and_decide().await?
                }
                Some(decision) => {
                    info!("recovered {} with persisted {}; resuming delivery", self.txn_id, decision);
                    self.publish_decision(decision, doc.acknowledged.len());
                    (decision.clone(), doc.unacknowledged())
                }
            },
        };

        self.deliver(&decision, pending).await?;

        self.transition(CoordinatorState::Deleting);
        let op_time = self
            .log_op("delete", || log.delete_document(&self.txn_id))
            .await?;
        self.log_op("delete majority", || log.wait_for_majority(op_time))
            .await?;
        self.transition(CoordinatorState::Done);
        Ok(decision)
    }

    /// Run one decision log operation, retrying storage failures with backoff
    ///
    /// SAFETY: Every operation passed here is idempotent. A NotPrimary rejection
    /// marks the whole term as deposed.
    async fn log_op<T, F, Fut>(&self, what: &str, mut op: F) -> CoordinatorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LogResult<T>>,
    {
        let mut backoff = self.deps.backoff();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(DecisionLogError::Storage(reason)) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "decision log {} for {} failed ({}); retry {} in {:?}",
                        what,
                        self.txn_id,
                        reason,
                        backoff.attempts(),
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(DecisionLogError::NotPrimary { term }) => {
                    error!(
                        "decision log rejected {} for {}: term {} is over",
                        what, self.txn_id, term
                    );
                    self.deps.deposed.cancel();
                    return Err(self.interrupted_error("decision log reports this node is no longer primary"));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// kPreparing and kMakingDecision; returns the durable decision and the
    /// participants that still need it
    async fn prepare_and_decide(&self) -> CoordinatorResult<(Decision, Vec<ShardId>)> {
        let log = &self.deps.log;
        self.transition(CoordinatorState::Preparing);
        let (decision, abort_voters) = match self.prepare_phase().await {
            Ok(prepared) => prepared,
            Err(err) => {
                // Nothing was decided; drop the document so recovery does not retry
                warn!("{}; discarding undecided coordinator document", err);
                let op_time = self
                    .log_op("discard", || log.delete_document(&self.txn_id))
                    .await?;
                self.log_op("discard majority", || log.wait_for_majority(op_time))
                    .await?;
                return Err(err);
            }
        };

        // Leaving kPreparing and reading the abort flag is one step, so
        // request_abort's answer matches what is decided here
        let mut abort_requested = false;
        self.progress.send_modify(|p| {
            info!("coordinator {}: {} -> {}", self.txn_id, p.state, CoordinatorState::MakingDecision);
            p.state = CoordinatorState::MakingDecision;
            abort_requested = p.abort_requested;
        });
        let (decision, abort_voters) = if abort_requested && decision.is_commit() {
            info!("abort requested for {} before its commit decision was written", self.txn_id);
            (Decision::abort("transaction aborted by client"), BTreeSet::new())
        } else {
            (decision, abort_voters)
        };

        let (persisted, op_time) = self
            .log_op("decision", || log.write_decision(&self.txn_id, &decision, &abort_voters))
            .await?;
        self.log_op("decision majority", || log.wait_for_majority(op_time))
            .await?;
        info!("decision for {} is durable: {}", self.txn_id, persisted);

        let pending: Vec<ShardId> = self
            .participants
            .iter()
            .filter(|shard| !abort_voters.contains(*shard))
            .cloned()
            .collect();
        self.publish_decision(&persisted, self.participants.len() - pending.len());
        Ok((persisted, pending))
    }

    fn publish_decision(&self, decision: &Decision, acknowledged: usize) {
        self.progress.send_modify(|p| {
            p.decision = Some(decision.clone());
            p.acknowledged = acknowledged;
        });
    }

    /// Fan prepare out to every participant and reduce the replies to a decision
    ///
    /// SAFETY: Returning drops the in-flight prepares; nothing is sent after.
    async fn prepare_phase(&self) -> CoordinatorResult<(Decision, BTreeSet<ShardId>)> {
        let mut pending: FuturesUnordered<_> = self
            .participants
            .iter()
            .map(|shard| async move { (shard, self.prepare_one(shard).await) })
            .collect();

        let deadline = self.deps.config.prepare_deadline();
        let expired = async {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        let mut votes = BTreeMap::new();
        loop {
            tokio::select! {
                biased;
                _ = self.abort_requested.cancelled() => {
                    info!("abort requested for {} during prepare", self.txn_id);
                    return Ok((Decision::abort("transaction aborted by client"), BTreeSet::new()));
                }
                _ = &mut expired => {
                    let waited = deadline.map(|d| d.as_millis()).unwrap_or_default();
                    warn!("prepare of {} exceeded {}ms", self.txn_id, waited);
                    return Ok((
                        Decision::abort(format!("prepare did not complete within {}ms", waited)),
                        BTreeSet::new(),
                    ));
                }
                next = pending.next() => match next {
                    None => break,
                    Some((shard, Ok(Vote::Abort { reason }))) => {
                        info!("shard {} voted to abort {}: {}", shard, self.txn_id, reason);
                        let voters = BTreeSet::from([shard.clone()]);
                        return Ok((
                            Decision::abort(format!("shard {} voted abort: {}", shard, reason)),
                            voters,
                        ));
                    }
                    Some((shard, Ok(vote))) => {
                        debug!("shard {} voted {:?} for {}", shard, vote, self.txn_id);
                        votes.insert(shard.clone(), vote);
                    }
                    Some((shard, Err(err))) if err.code() == Some(ErrorCode::TransactionCommitted) => {
                        return Err(CoordinatorError::ParticipantAlreadyCommitted {
                            txn_id: self.txn_id,
                            shard: shard.clone(),
                        });
                    }
                    Some((shard, Err(err))) => {
                        warn!("shard {} cannot prepare {}: {}", shard, self.txn_id, err);
                        return Ok((
                            Decision::abort(format!("shard {} failed to prepare: {}", shard, err)),
                            BTreeSet::new(),
                        ));
                    }
                },
            }
        }

        let decision =
            decide(&votes).unwrap_or_else(|| Decision::abort("no participant votes were collected"));
        Ok((decision, BTreeSet::new()))
    }

    /// Prepare one participant, retrying retryable errors and bounded stale errors
    async fn prepare_one(&self, shard: &ShardId) -> Result<Vote, ParticipantError> {
        let mut backoff = self.deps.backoff();
        let mut stale_errors = 0u32;
        loop {
            let err = match self.deps.client.prepare(shard, &self.txn_id).await {
                Ok(vote) => return Ok(vote),
                Err(err) => err,
            };

            match err.class() {
                ErrorClass::Retryable => {}
                ErrorClass::Stale => {
                    stale_errors += 1;
                    if stale_errors > self.deps.config.stale_retry_limit {
                        return Err(err);
                    }
                }
                ErrorClass::Terminal => return Err(err),
            }

            let delay = backoff.next_delay();
            warn!(
                "prepare {} on shard {} failed ({}); retry {} in {:?}",
                self.txn_id,
                shard,
                err,
                backoff.attempts(),
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// kCommitting / kAborting: deliver the durable decision to `pending`
    async fn deliver(&self, decision: &Decision, pending: Vec<ShardId>) -> CoordinatorResult<()> {
        self.transition(if decision.is_commit() {
            CoordinatorState::Committing
        } else {
            CoordinatorState::Aborting
        });

        try_join_all(pending.iter().map(|shard| self.deliver_one(shard, decision))).await?;
        Ok(())
    }

    async fn deliver_one(&self, shard: &ShardId, decision: &Decision) -> CoordinatorResult<()> {
        let mut backoff = self.deps.backoff();
        loop {
            let result = match decision {
                Decision::Commit { commit_timestamp } => {
                    self.deps
                        .client
                        .commit(shard, &self.txn_id, *commit_timestamp)
                        .await
                }
                Decision::Abort { .. } => match self.deps.client.abort(shard, &self.txn_id).await {
                    // Nothing to abort on the participant
                    Err(err) if err.code() == Some(ErrorCode::NoSuchTransaction) => Ok(()),
                    other => other,
                },
            };

            match result {
                Ok(()) => break,
                Err(err) => {
                    let delay = backoff.next_delay();
                    if backoff.attempts() % 10 == 0 {
                        error!(
                            "delivering {} to shard {} still failing after {} attempts: {}",
                            decision,
                            shard,
                            backoff.attempts(),
                            err
                        );
                    } else {
                        warn!("delivering {} to shard {} failed ({}); retry in {:?}", decision, shard, err, delay);
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.log_op("acknowledgement", || self.deps.log.record_acknowledgement(&self.txn_id, shard))
            .await?;
        self.progress.send_modify(|p| p.acknowledged += 1);
        debug!("shard {} acknowledged {} for {}", shard, decision, self.txn_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision_log::{FaultyDecisionLog, InMemoryReplicaSet};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use txcoord_core::{SessionId, Timestamp};

    /// Participant client answering from a per-shard script of prepare replies
    #[derive(Default)]
    struct ScriptedClient {
        prepare_replies: Mutex<BTreeMap<ShardId, Vec<Result<Vote, ErrorCode>>>>,
        sent: Mutex<Vec<(ShardId, &'static str)>>,
    }

    impl ScriptedClient {
        fn script(&self, shard: &str, replies: Vec<Result<Vote, ErrorCode>>) {
            self.prepare_replies.lock().insert(ShardId::new(shard), replies);
        }

        fn sent(&self, name: &str) -> Vec<ShardId> {
            self.sent
                .lock()
                .iter()
                .filter(|(_, n)| *n == name)
                .map(|(s, _)| s.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ParticipantClient for ScriptedClient {
        async fn prepare(&self, shard: &ShardId, _txn_id: &TransactionId) -> Result<Vote, ParticipantError> {
            self.sent.lock().push((shard.clone(), "prepare"));
            let mut replies = self.prepare_replies.lock();
            let script = replies.entry(shard.clone()).or_default();
            let reply = if script.len() > 1 {
                script.remove(0)
            } else {
                script.first().cloned().unwrap_or(Ok(Vote::Commit {
                    prepare_timestamp: Timestamp(1),
                }))
            };
            reply.map_err(|code| ParticipantError::Command {
                shard: shard.clone(),
                code,
                message: "scripted".into(),
            })
        }

        async fn commit(&self, shard: &ShardId, _: &TransactionId, _: Timestamp) -> Result<(), ParticipantError> {
            self.sent.lock().push((shard.clone(), "commit"));
            Ok(())
        }

        async fn abort(&self, shard: &ShardId, _: &TransactionId) -> Result<(), ParticipantError> {
            self.sent.lock().push((shard.clone(), "abort"));
            Ok(())
        }
    }

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            backoff_initial_ms: 1,
            backoff_max_ms: 5,
            ..Default::default()
        }
    }

    fn instance(
        client: Arc<ScriptedClient>,
        config: CoordinatorConfig,
        shards: &[&str],
    ) -> (CoordinatorInstance, Arc<InMemoryReplicaSet>) {
        let set = InMemoryReplicaSet::new();
        let log: Arc<dyn DecisionLog> = Arc::new(set.elect_primary());
        let deps = CoordinatorDeps::new(log, client, config);
        let participants = ParticipantList::new(shards.iter().map(|s| ShardId::new(*s))).unwrap();
        let txn_id = TransactionId::new(SessionId::from_bytes([8u8; 16]), 1);
        (
            CoordinatorInstance::new(txn_id, participants, StartPoint::Fresh, deps, CancellationToken::new()),
            set,
        )
    }

    #[tokio::test]
    async fn test_commit_path_deletes_document() {
        let client = Arc::new(ScriptedClient::default());
        client.script("s1", vec![Ok(Vote::Commit { prepare_timestamp: Timestamp(4) })]);
        client.script("s2", vec![Ok(Vote::Commit { prepare_timestamp: Timestamp(9) })]);
        let (coordinator, set) = instance(client.clone(), config(), &["s1", "s2"]);

        let decision = coordinator.run().await.unwrap();
        assert_eq!(decision, Decision::Commit { commit_timestamp: Timestamp(9) });
        assert_eq!(coordinator.progress().state, CoordinatorState::Done);
        assert_eq!(client.sent("commit").len(), 2);
        assert_eq!(set.document_count(), 0);
    }

    #[tokio::test]
    async fn test_retryable_prepare_errors_do_not_abort() {
        let client = Arc::new(ScriptedClient::default());
        client.script(
            "s1",
            vec![
                Err(ErrorCode::HostUnreachable),
                Err(ErrorCode::LockBusy),
                Ok(Vote::Commit { prepare_timestamp: Timestamp(3) }),
            ],
        );
        let (coordinator, _) = instance(client.clone(), config(), &["s1"]);

        assert!(coordinator.run().await.unwrap().is_commit());
        assert_eq!(client.sent("prepare").len(), 3);
    }

    #[tokio::test]
    async fn test_stale_errors_abort_after_limit() {
        let client = Arc::new(ScriptedClient::default());
        client.script("s1", vec![Err(ErrorCode::StaleEpoch)]);
        client.script("s2", vec![Ok(Vote::Commit { prepare_timestamp: Timestamp(3) })]);
        let config = CoordinatorConfig {
            stale_retry_limit: 2,
            ..config()
        };
        let (coordinator, _) = instance(client.clone(), config, &["s1", "s2"]);

        let decision = coordinator.run().await.unwrap();
        assert!(!decision.is_commit());
        let stale_prepares = client.sent("prepare").iter().filter(|s| s.as_str() == "s1").count();
        assert_eq!(stale_prepares, 3);
    }

    #[tokio::test]
    async fn test_terminal_prepare_error_aborts_everyone() {
        let client = Arc::new(ScriptedClient::default());
        client.script("s1", vec![Err(ErrorCode::NoSuchTransaction)]);
        let (coordinator, _) = instance(client.clone(), config(), &["s1", "s2"]);

        assert!(!coordinator.run().await.unwrap().is_commit());
        assert_eq!(client.sent("abort").len(), 2);
        assert!(client.sent("commit").is_empty());
    }

    #[tokio::test]
    async fn test_prepare_deadline_aborts() {
        let client = Arc::new(ScriptedClient::default());
        client.script("s1", vec![Err(ErrorCode::NetworkTimeout)]);
        let config = CoordinatorConfig {
            prepare_deadline_ms: Some(30),
            ..config()
        };
        let (coordinator, _) = instance(client, config, &["s1"]);

        match coordinator.run().await.unwrap() {
            Decision::Abort { reason } => assert!(reason.contains("30ms")),
            other => panic!("expected abort, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_request_abort_short_circuits_prepare() {
        let client = Arc::new(ScriptedClient::default());
        client.script("s1", vec![Err(ErrorCode::HostUnreachable)]);
        let (coordinator, _) = instance(client.clone(), config(), &["s1"]);
        let coordinator = Arc::new(coordinator);

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.request_abort());

        let decision = task.await.unwrap().unwrap();
        assert!(!decision.is_commit());
        assert!(!coordinator.request_abort());
    }

    #[tokio::test]
    async fn test_interrupt_leaves_document_for_recovery() {
        let client = Arc::new(ScriptedClient::default());
        client.script("s1", vec![Err(ErrorCode::HostUnreachable)]);
        let (coordinator, set) = instance(client, config(), &["s1"]);
        let coordinator = Arc::new(coordinator);

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.interrupt();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordinatorError::Interrupted { .. }));
        assert_eq!(set.document_count(), 1);
        assert!(coordinator.wait_for_decision().await.is_err());
    }

    fn txn_id() -> TransactionId {
        TransactionId::new(SessionId::from_bytes([8u8; 16]), 1)
    }

    #[tokio::test]
    async fn test_storage_failures_on_decision_write_are_retried() {
        let client = Arc::new(ScriptedClient::default());
        client.script("s1", vec![Ok(Vote::Commit { prepare_timestamp: Timestamp(4) })]);
        let set = InMemoryReplicaSet::new();
        let log = FaultyDecisionLog::new(
            set.elect_primary(),
            vec![
                DecisionLogError::Storage("disk busy".into()),
                DecisionLogError::Storage("disk busy".into()),
            ],
        );
        let deps = CoordinatorDeps::new(Arc::new(log), client.clone(), config());
        let participants = ParticipantList::new(vec![ShardId::new("s1")]).unwrap();
        let coordinator =
            CoordinatorInstance::new(txn_id(), participants, StartPoint::Fresh, deps, CancellationToken::new());

        let decision = coordinator.run().await.unwrap();
        assert_eq!(decision, Decision::Commit { commit_timestamp: Timestamp(4) });
        assert_eq!(set.decisions_written(&txn_id()), vec![decision]);
        assert_eq!(set.document_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_write_marks_term_deposed() {
        let client = Arc::new(ScriptedClient::default());
        let set = InMemoryReplicaSet::new();
        let log = FaultyDecisionLog::new(set.elect_primary(), vec![DecisionLogError::NotPrimary { term: 1 }]);
        let deps = CoordinatorDeps::new(Arc::new(log), client.clone(), config());
        let participants = ParticipantList::new(vec![ShardId::new("s1")]).unwrap();
        let coordinator = CoordinatorInstance::new(
            txn_id(),
            participants,
            StartPoint::Fresh,
            deps.clone(),
            CancellationToken::new(),
        );

        let err = coordinator.run().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Interrupted { .. }));
        assert!(deps.deposed().is_cancelled());
        assert!(client.sent("commit").is_empty() && client.sent("abort").is_empty());
    }

    #[tokio::test]
    async fn test_committed_participant_never_leads_to_abort() {
        let client = Arc::new(ScriptedClient::default());
        client.script("s1", vec![Err(ErrorCode::TransactionCommitted)]);
        let (coordinator, set) = instance(client.clone(), config(), &["s1", "s2"]);

        let err = coordinator.run().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ParticipantAlreadyCommitted { .. }));
        assert_eq!(err.code(), ErrorCode::TransactionCommitted);
        assert!(set.decisions_written(&txn_id()).is_empty());
        assert_eq!(set.document_count(), 0);
        assert!(client.sent("abort").is_empty());
        assert!(client.sent("commit").is_empty());
        assert!(coordinator.wait_for_decision().await.is_err());
    }

    #[tokio::test]
    async fn test_abort_request_after_prepare_finished_is_refused() {
        let client = Arc::new(ScriptedClient::default());
        client.script("s1", vec![Ok(Vote::Commit { prepare_timestamp: Timestamp(9) })]);
        let (coordinator, set) = instance(client, config(), &["s1"]);
        let coordinator = Arc::new(coordinator);
        set.set_auto_majority(false);

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };
        while set.document(&txn_id()).is_none() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // Participant list becomes durable; the decision write will not
        set.advance_majority();
        let mut progress = coordinator.subscribe();
        progress
            .wait_for(|p| p.state == CoordinatorState::MakingDecision)
            .await
            .unwrap();
        assert!(coordinator.progress().decision.is_none());
        assert!(!coordinator.request_abort());

        set.set_auto_majority(true);
        let decision = task.await.unwrap().unwrap();
        assert_eq!(decision, Decision::Commit { commit_timestamp: Timestamp(9) });
    }
}
