// CROSS-SHARD COMMIT COORDINATION
// Transaction Coordinator Service - client-facing entry points and role changes
//
// SAFETY INVARIANTS:
// 1. No request touches the catalog until step-up recovery finished
// 2. A client-side timeout never cancels the coordinator
// 3. Step-down stops every coordinator and fails every waiter with Interrupted
// 4. An abort request cannot reverse a durable commit decision
// 5. A decision log rejecting this term's writes steps the whole node down
// 6. A finished transaction's recorded outcome is returned, never re-prepared

use crate::catalog::{Attachment, CoordinatorCatalog};
use crate::coordinator::{CoordinatorDeps, CoordinatorInstance, CoordinatorReport, StartPoint};
use crate::decision_log::DecisionLog;
use crate::participant_client::ParticipantClient;
use crate::recovery::{RecoveryReport, RecoveryService};
use crate::session_serializer::{InDoubtStatus, SessionAdmission, SessionSerializer};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use txcoord_core::{
    CoordinatorCommand, CoordinatorConfig, CoordinatorError, CoordinatorReply, CoordinatorResult,
    Decision, ParticipantList, ShardId, TransactionId,
};

/// This node's role in the coordinator replica set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeRole {
    Secondary,
    /// Primary, but step-up recovery has not finished
    Recovering,
    Primary,
}

struct PrimaryTerm {
    deps: Arc<CoordinatorDeps>,
    cancel: CancellationToken,
}

/// Admin snapshot of the service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub role: NodeRole,
    pub coordinators: Vec<CoordinatorReport>,
}

/// Entry point for coordinateCommitTransaction / commitTransaction / abortTransaction
pub struct TransactionCoordinatorService {
    client: Arc<dyn ParticipantClient>,
    config: CoordinatorConfig,
    sessions: Arc<SessionSerializer>,
    catalog: Arc<CoordinatorCatalog>,
    role: watch::Sender<NodeRole>,
    term: Mutex<Option<PrimaryTerm>>,
}

impl TransactionCoordinatorService {
    pub fn new(client: Arc<dyn ParticipantClient>, config: CoordinatorConfig) -> Arc<Self> {
        let sessions = Arc::new(SessionSerializer::new());
        let catalog = CoordinatorCatalog::new(sessions.clone(), config.finished_cache_capacity);
        let (role, _) = watch::channel(NodeRole::Secondary);
        Arc::new(TransactionCoordinatorService {
            client,
            config,
            sessions,
            catalog,
            role,
            term: Mutex::new(None),
        })
    }

    pub fn role(&self) -> NodeRole {
        *self.role.borrow()
    }

    pub fn catalog(&self) -> &Arc<CoordinatorCatalog> {
        &self.catalog
    }

    pub fn sessions(&self) -> &Arc<SessionSerializer> {
        &self.sessions
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Become primary with `log` as this term's decision log, then run recovery
    pub async fn on_step_up(self: &Arc<Self>, log: Arc<dyn DecisionLog>) -> CoordinatorResult<RecoveryReport> {
        // Coordinators of the previous term must be gone before recovery re-creates them
        self.catalog.join().await;

        let cancel = CancellationToken::new();
        let deps = CoordinatorDeps::new(log, self.client.clone(), self.config.clone());
        let previous = self.term.lock().replace(PrimaryTerm {
            deps: deps.clone(),
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        Self::watch_for_deposition(Arc::downgrade(self), deps.deposed().clone(), cancel.clone());
        self.role.send_replace(NodeRole::Recovering);
        info!("stepped up; running coordinator recovery");

        let recovery = RecoveryService::new(deps, self.catalog.clone(), self.sessions.clone());
        match recovery.recover(&cancel).await {
            Ok(report) => {
                if !cancel.is_cancelled() {
                    self.role.send_replace(NodeRole::Primary);
                    info!("step-up complete; accepting commit requests");
                }
                Ok(report)
            }
            Err(err) => {
                warn!("step-up recovery failed: {}", err);
                self.on_step_down();
                Err(err)
            }
        }
    }

    /// Step down when a coordinator of this term finds the log has moved on
    fn watch_for_deposition(service: Weak<Self>, deposed: CancellationToken, term: CancellationToken) {
        tokio::spawn(async move {
            tokio::select! {
                _ = term.cancelled() => {}
                _ = deposed.cancelled() => {
                    if let Some(service) = service.upgrade() {
                        if !term.is_cancelled() {
                            warn!("decision log rejected a write of the current term; stepping down");
                            service.on_step_down();
                        }
                    }
                }
            }
        });
    }

    /// Lose primary: interrupt coordinators and every blocked caller
    pub fn on_step_down(&self) {
        let previous = self.role.send_replace(NodeRole::Secondary);
        if let Some(term) = self.term.lock().take() {
            term.cancel.cancel();
        }
        self.catalog.interrupt_all();
        self.sessions.interrupt_all();
        if previous != NodeRole::Secondary {
            info!("stepped down from {:?}", previous);
        }
    }

    /// Admit a transaction statement on its session
    pub async fn begin_or_attach(
        &self,
        txn_id: &TransactionId,
        start_transaction: bool,
    ) -> CoordinatorResult<SessionAdmission> {
        self.primary_term().await?;
        self.sessions.begin_or_attach(txn_id, start_transaction).await
    }

    /// coordinateCommitTransaction: run (or join) two-phase commit and return the decision
    pub async fn coordinate_commit(
        &self,
        txn_id: &TransactionId,
        participants: Vec<ShardId>,
        max_wait: Option<Duration>,
    ) -> CoordinatorResult<Decision> {
        let participants = ParticipantList::new(participants)?;
        let wait_for_persisted = self.config.return_after_decision_persisted;

        self.with_deadline(txn_id, max_wait, async {
            let (deps, cancel) = self.primary_term().await?;
            if let Some(decision) = Self::recorded_decision(&deps, txn_id).await? {
                debug!("{} already finished with {}", txn_id, decision);
                return Ok(decision);
            }
            let admission = self.sessions.claim_for_commit(txn_id).await?;

            let attachment = self.catalog.create_or_attach(
                *txn_id,
                participants,
                StartPoint::Fresh,
                deps,
                &cancel,
            );
            let instance = match attachment {
                Ok(Attachment::Created(instance)) | Ok(Attachment::Attached(instance)) => instance,
                Ok(Attachment::Finished(decision)) => {
                    self.undo_claim(txn_id, admission);
                    return Ok(decision);
                }
                Err(err) => {
                    self.undo_claim(txn_id, admission);
                    return Err(err);
                }
            };

            if wait_for_persisted {
                instance.wait_for_decision().await
            } else {
                instance.wait_for_completion().await
            }
        })
        .await
    }

    /// Client commitTransaction; an abort decision is reported as an error
    ///
    /// Without a participant list the call only joins an existing coordinator.
    pub async fn commit_transaction(
        &self,
        txn_id: &TransactionId,
        participants: Option<Vec<ShardId>>,
        max_wait: Option<Duration>,
    ) -> CoordinatorResult<Decision> {
        let decision = match participants {
            Some(participants) => self.coordinate_commit(txn_id, participants, max_wait).await?,
            None => {
                self.with_deadline(txn_id, max_wait, async {
                    let (deps, _) = self.primary_term().await?;
                    match self.lookup(&deps, txn_id).await? {
                        Some(Ok(instance)) => instance.wait_for_decision().await,
                        Some(Err(decision)) => Ok(decision),
                        None => Err(CoordinatorError::NoSuchTransaction { txn_id: *txn_id }),
                    }
                })
                .await?
            }
        };

        match decision {
            Decision::Abort { reason } => Err(CoordinatorError::TransactionAborted {
                txn_id: *txn_id,
                reason,
            }),
            commit => Ok(commit),
        }
    }

    /// Client abortTransaction
    ///
    /// Aborts the live coordinator if its decision is not yet durable. Fails with
    /// `TransactionCommitted` once a commit decision exists.
    pub async fn abort_transaction(
        &self,
        txn_id: &TransactionId,
        max_wait: Option<Duration>,
    ) -> CoordinatorResult<Decision> {
        let decision = self
            .with_deadline(txn_id, max_wait, async {
                let (deps, _) = self.primary_term().await?;
                match self.lookup(&deps, txn_id).await? {
                    Some(Ok(instance)) => {
                        if !instance.request_abort() {
                            debug!("abort of {} arrived after the decision was durable", txn_id);
                        }
                        instance.wait_for_decision().await
                    }
                    Some(Err(decision)) => Ok(decision),
                    None => {
                        // Not in two-phase commit yet: nothing to coordinate
                        self.sessions.abort_active(txn_id);
                        Ok(Decision::abort("transaction aborted by client"))
                    }
                }
            })
            .await?;

        match decision {
            Decision::Commit { commit_timestamp } => Err(CoordinatorError::TransactionCommitted {
                txn_id: *txn_id,
                commit_timestamp,
            }),
            abort => Ok(abort),
        }
    }

    /// Decode one JSON command and run it
    pub async fn handle_command(&self, command: CoordinatorCommand) -> CoordinatorReply {
        let txn_id = command.txn_id();
        let max_wait = |ms: Option<u64>| ms.map(Duration::from_millis);

        let result = match command {
            CoordinatorCommand::TransactionStatement {
                start_transaction, ..
            } => self
                .begin_or_attach(&txn_id, start_transaction)
                .await
                .map(|_| None),
            CoordinatorCommand::CoordinateCommitTransaction {
                participants,
                max_time_ms,
                ..
            } => self
                .coordinate_commit(&txn_id, participants, max_wait(max_time_ms))
                .await
                .map(Some),
            CoordinatorCommand::CommitTransaction {
                participants,
                max_time_ms,
                ..
            } => self
                .commit_transaction(&txn_id, participants, max_wait(max_time_ms))
                .await
                .map(Some),
            CoordinatorCommand::AbortTransaction { max_time_ms, .. } => self
                .abort_transaction(&txn_id, max_wait(max_time_ms))
                .await
                .map(Some),
        };

        match result {
            Ok(Some(decision)) => CoordinatorReply::from_decision(&decision),
            Ok(None) => CoordinatorReply::ok(),
            Err(err) => {
                debug!("command for {} failed: {}", txn_id, err);
                CoordinatorReply::from_error(&err)
            }
        }
    }

    pub fn report(&self) -> ServiceReport {
        ServiceReport {
            role: self.role(),
            coordinators: self.catalog.report(),
        }
    }

    /// Live coordinator, or the decision of a finished one
    async fn lookup(
        &self,
        deps: &CoordinatorDeps,
        txn_id: &TransactionId,
    ) -> CoordinatorResult<Option<Result<Arc<CoordinatorInstance>, Decision>>> {
        if let Some(instance) = self.catalog.get(txn_id) {
            return Ok(Some(Ok(instance)));
        }
        if let Some(decision) = self.catalog.finished_decision(txn_id) {
            return Ok(Some(Err(decision)));
        }
        Ok(Self::recorded_decision(deps, txn_id).await?.map(Err))
    }

    /// Decision the log recorded for `txn_id` after its coordinator finished
    ///
    /// Fails with TransactionTooOld when a newer transaction on the session
    /// already finished.
    async fn recorded_decision(
        deps: &CoordinatorDeps,
        txn_id: &TransactionId,
    ) -> CoordinatorResult<Option<Decision>> {
        let Some(outcome) = deps.log.read_session_outcome(&txn_id.session_id).await? else {
            return Ok(None);
        };
        if outcome.txn_number == txn_id.txn_number {
            Ok(Some(outcome.decision))
        } else if outcome.txn_number > txn_id.txn_number {
            Err(CoordinatorError::TransactionTooOld {
                session_id: txn_id.session_id,
                requested: txn_id.txn_number,
                highest: outcome.txn_number,
            })
        } else {
            Ok(None)
        }
    }

    fn undo_claim(&self, txn_id: &TransactionId, admission: SessionAdmission) {
        if admission == SessionAdmission::Started {
            self.sessions.release(txn_id, InDoubtStatus::Resolved);
        }
    }

    /// Wait out step-up recovery and return the current term
    async fn primary_term(&self) -> CoordinatorResult<(Arc<CoordinatorDeps>, CancellationToken)> {
        let mut roles = self.role.subscribe();
        let role = roles
            .wait_for(|r| *r != NodeRole::Recovering)
            .await
            .map(|r| *r)
            .map_err(|_| CoordinatorError::NotPrimary)?;
        if role != NodeRole::Primary {
            return Err(CoordinatorError::NotPrimary);
        }

        self.term
            .lock()
            .as_ref()
            .map(|term| (term.deps.clone(), term.cancel.clone()))
            .ok_or(CoordinatorError::NotPrimary)
    }

    /// Bound a client wait; the coordinator keeps running when it expires
    async fn with_deadline<T>(
        &self,
        txn_id: &TransactionId,
        max_wait: Option<Duration>,
        wait: impl Future<Output = CoordinatorResult<T>>,
    ) -> CoordinatorResult<T> {
        match max_wait {
            None => wait.await,
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    info!("client gave up on {} after {:?}; coordination continues", txn_id, limit);
                    Err(CoordinatorError::MaxTimeMsExpired {
                        txn_id: *txn_id,
                        waited_ms: limit.as_millis() as u64,
                    })
                }
            },
        }
    }
}
