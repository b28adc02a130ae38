// CROSS-SHARD COMMIT COORDINATION
// Coordinator Catalog - process-wide registry of live coordinators
//
// SAFETY INVARIANTS:
// 1. At most one live coordinator per TransactionId
// 2. An entry is removed only by its own task, after the task stops
// 3. A finished decision is cached before the session is released
// 4. A coordinator that stops without finishing releases its session as
//    Interrupted, so waiters fail instead of blocking
// 5. Lock order: catalog state, then the session table

use crate::coordinator::{CoordinatorDeps, CoordinatorInstance, CoordinatorReport, StartPoint};
use crate::session_serializer::{InDoubtStatus, SessionSerializer};
use log::{debug, info, warn};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use txcoord_core::{CoordinatorError, CoordinatorResult, Decision, ParticipantList, TransactionId};

/// Outcome of registering a coordinator request
#[derive(Clone)]
pub enum Attachment {
    /// A new coordinator was spawned
    Created(Arc<CoordinatorInstance>),
    /// Joined the live coordinator for the same transaction
    Attached(Arc<CoordinatorInstance>),
    /// The transaction already finished with this decision
    Finished(Decision),
}

struct CatalogState {
    active: HashMap<TransactionId, Arc<CoordinatorInstance>>,
    finished: LruCache<TransactionId, Decision>,
}

/// Registry mapping TransactionId to its live coordinator
pub struct CoordinatorCatalog {
    state: Mutex<CatalogState>,
    sessions: Arc<SessionSerializer>,
    active_count: watch::Sender<usize>,
}

impl CoordinatorCatalog {
    pub fn new(sessions: Arc<SessionSerializer>, finished_capacity: usize) -> Arc<Self> {
        let capacity = NonZeroUsize::new(finished_capacity).unwrap_or(NonZeroUsize::MIN);
        let (active_count, _) = watch::channel(0);
        Arc::new(CoordinatorCatalog {
            state: Mutex::new(CatalogState {
                active: HashMap::new(),
                finished: LruCache::new(capacity),
            }),
            sessions,
            active_count,
        })
    }

    /// Look up or spawn the coordinator for `txn_id`
    ///
    /// SAFETY: Check-and-insert happens under one lock, so two callers can never
    /// both spawn a coordinator for the same transaction.
    pub fn create_or_attach(
        self: &Arc<Self>,
        txn_id: TransactionId,
        participants: ParticipantList,
        start: StartPoint,
        deps: Arc<CoordinatorDeps>,
        shutdown: &CancellationToken,
    ) -> CoordinatorResult<Attachment> {
        let mut state = self.state.lock();

        if let Some(existing) = state.active.get(&txn_id) {
            if !existing.participants().same_members(&participants) {
                return Err(CoordinatorError::ParticipantListMismatch { txn_id });
            }
            debug!("attached to live coordinator {}", txn_id);
            return Ok(Attachment::Attached(existing.clone()));
        }

        if matches!(start, StartPoint::Fresh) {
            if let Some(decision) = state.finished.get(&txn_id) {
                debug!("{} already finished with {}", txn_id, decision);
                return Ok(Attachment::Finished(decision.clone()));
            }
        }

        let instance = Arc::new(CoordinatorInstance::new(
            txn_id,
            participants,
            start,
            deps,
            shutdown.child_token(),
        ));
        state.active.insert(txn_id, instance.clone());
        self.active_count.send_replace(state.active.len());
        drop(state);

        let catalog = self.clone();
        let task_instance = instance.clone();
        tokio::spawn(async move {
            let result = task_instance.run().await;
            catalog.finish(&task_instance, result);
        });

        info!("spawned coordinator for {}", txn_id);
        Ok(Attachment::Created(instance))
    }

    fn finish(&self, instance: &Arc<CoordinatorInstance>, result: CoordinatorResult<Decision>) {
        let txn_id = *instance.txn_id();
        let mut state = self.state.lock();
        if state
            .active
            .get(&txn_id)
            .is_some_and(|current| Arc::ptr_eq(current, instance))
        {
            state.active.remove(&txn_id);
        }

        match &result {
            Ok(decision) => {
                state.finished.put(txn_id, decision.clone());
                self.sessions.release(&txn_id, InDoubtStatus::Resolved);
            }
            // No-op after step-down, which already interrupted the session
            Err(err) => {
                warn!("coordinator {} gave up its session: {}", txn_id, err);
                self.sessions.release(&txn_id, InDoubtStatus::Interrupted);
            }
        }
        self.active_count.send_replace(state.active.len());
    }

    pub fn get(&self, txn_id: &TransactionId) -> Option<Arc<CoordinatorInstance>> {
        self.state.lock().active.get(txn_id).cloned()
    }

    /// Decision of a recently finished coordinator
    pub fn finished_decision(&self, txn_id: &TransactionId) -> Option<Decision> {
        self.state.lock().finished.peek(txn_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        *self.active_count.borrow()
    }

    /// Admin projection of every live coordinator, ordered by TransactionId
    pub fn report(&self) -> Vec<CoordinatorReport> {
        let instances: Vec<_> = self.state.lock().active.values().cloned().collect();
        let mut reports: Vec<_> = instances.iter().map(|i| i.report()).collect();
        reports.sort_by(|a, b| a.txn_id.cmp(&b.txn_id));
        reports
    }

    /// Stop every live coordinator; their documents stay in the log
    pub fn interrupt_all(&self) {
        let instances: Vec<_> = self.state.lock().active.values().cloned().collect();
        if !instances.is_empty() {
            info!("interrupting {} live coordinators", instances.len());
        }
        for instance in instances {
            instance.interrupt();
        }
    }

    /// Wait until no coordinator task is running
    pub async fn join(&self) {
        let mut count = self.active_count.subscribe();
        let _ = count.wait_for(|n| *n == 0).await;
    }
}
