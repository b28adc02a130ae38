// CROSS-SHARD COMMIT COORDINATION
// Session Serializer - at most one in-doubt transaction per logical session
//
// SAFETY INVARIANTS:
// 1. A session has at most one in-doubt txnNumber at a time
// 2. A different txnNumber blocks (never fails) until the in-doubt one is released
// 3. The same txnNumber attaches to the in-doubt transaction
// 4. txnNumbers below the highest seen on the session are rejected

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::watch;
use txcoord_core::{CoordinatorError, CoordinatorResult, SessionId, TransactionId, TxnNumber};

/// How an in-doubt transaction left the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InDoubtStatus {
    Pending,
    /// Coordinator reached its terminal state (or the transaction was aborted)
    Resolved,
    /// The coordinator stopped without finishing; waiters must retry
    Interrupted,
}

/// Result of admitting a request on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAdmission {
    /// The request owns a newly started (or newly in-doubt) transaction
    Started,
    /// The request joined the transaction already in progress
    Attached,
}

struct InDoubt {
    txn_number: TxnNumber,
    status: watch::Sender<InDoubtStatus>,
}

#[derive(Default)]
struct SessionEntry {
    highest: Option<TxnNumber>,
    active: Option<TxnNumber>,
    in_doubt: Option<InDoubt>,
}

impl SessionEntry {
    fn check_not_too_old(&self, txn_id: &TransactionId) -> CoordinatorResult<()> {
        match self.highest {
            Some(highest) if txn_id.txn_number < highest => Err(CoordinatorError::TransactionTooOld {
                session_id: txn_id.session_id,
                requested: txn_id.txn_number,
                highest,
            }),
            _ => Ok(()),
        }
    }

    fn admit(&mut self, txn_number: TxnNumber) {
        self.active = Some(txn_number);
        self.highest = Some(self.highest.map_or(txn_number, |h| h.max(txn_number)));
    }
}

/// Read-only view of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub highest: Option<TxnNumber>,
    pub active: Option<TxnNumber>,
    pub in_doubt: Option<TxnNumber>,
}

/// What a caller does after inspecting the session table
enum Step {
    Done(SessionAdmission),
    WaitFor(watch::Receiver<InDoubtStatus>),
}

/// Per-session admission control
#[derive(Default)]
pub struct SessionSerializer {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a transaction statement on its session
    ///
    /// SAFETY: Blocks while a different txnNumber on the session is in doubt.
    pub async fn begin_or_attach(
        &self,
        txn_id: &TransactionId,
        start_transaction: bool,
    ) -> CoordinatorResult<SessionAdmission> {
        loop {
            let step = {
                let mut sessions = self.sessions.lock();
                let entry = sessions.entry(txn_id.session_id).or_default();
                entry.check_not_too_old(txn_id)?;

                let in_doubt_txn = entry.in_doubt.as_ref().map(|d| d.txn_number);
                if in_doubt_txn == Some(txn_id.txn_number) || entry.active == Some(txn_id.txn_number) {
                    Step::Done(SessionAdmission::Attached)
                } else if !start_transaction {
                    return Err(CoordinatorError::NoSuchTransaction { txn_id: *txn_id });
                } else if let Some(in_doubt) = &entry.in_doubt {
                    Step::WaitFor(in_doubt.status.subscribe())
                } else {
                    entry.admit(txn_id.txn_number);
                    Step::Done(SessionAdmission::Started)
                }
            };

            match step {
                Step::Done(admission) => {
                    debug!("session admitted {} as {:?}", txn_id, admission);
                    return Ok(admission);
                }
                Step::WaitFor(status) => {
                    info!("{} blocked behind an in-doubt transaction on its session", txn_id);
                    Self::wait_released(status, txn_id).await?;
                }
            }
        }
    }

    /// Mark `txn_id` as the session's in-doubt transaction before its coordinator starts
    ///
    /// Attaches when the same transaction is already in doubt and waits behind a
    /// different one.
    pub async fn claim_for_commit(&self, txn_id: &TransactionId) -> CoordinatorResult<SessionAdmission> {
        loop {
            let step = {
                let mut sessions = self.sessions.lock();
                let entry = sessions.entry(txn_id.session_id).or_default();

                match &entry.in_doubt {
                    Some(in_doubt) if in_doubt.txn_number == txn_id.txn_number => {
                        Step::Done(SessionAdmission::Attached)
                    }
                    Some(in_doubt) => {
                        entry.check_not_too_old(txn_id)?;
                        Step::WaitFor(in_doubt.status.subscribe())
                    }
                    None => {
                        entry.check_not_too_old(txn_id)?;
                        let (status, _) = watch::channel(InDoubtStatus::Pending);
                        entry.in_doubt = Some(InDoubt {
                            txn_number: txn_id.txn_number,
                            status,
                        });
                        entry.admit(txn_id.txn_number);
                        Step::Done(SessionAdmission::Started)
                    }
                }
            };

            match step {
                Step::Done(admission) => return Ok(admission),
                Step::WaitFor(status) => {
                    info!("commit of {} waits for the session's in-doubt transaction", txn_id);
                    Self::wait_released(status, txn_id).await?;
                }
            }
        }
    }

    /// Re-establish an in-doubt transaction found by step-up recovery
    pub fn mark_in_doubt_recovered(&self, txn_id: &TransactionId) {
        let mut sessions = self.sessions.lock();
        let entry = sessions.entry(txn_id.session_id).or_default();
        match &entry.in_doubt {
            Some(existing) if existing.txn_number != txn_id.txn_number => {
                warn!(
                    "recovered {} while txnNumber {} is already in doubt on the session",
                    txn_id, existing.txn_number
                );
            }
            Some(_) => {}
            None => {
                let (status, _) = watch::channel(InDoubtStatus::Pending);
                entry.in_doubt = Some(InDoubt {
                    txn_number: txn_id.txn_number,
                    status,
                });
            }
        }
        entry.admit(txn_id.txn_number);
    }

    /// Clear `txn_id` from its session and wake everything blocked behind it
    pub fn release(&self, txn_id: &TransactionId, status: InDoubtStatus) {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(&txn_id.session_id) else {
            return;
        };

        if entry.active == Some(txn_id.txn_number) {
            entry.active = None;
        }
        if entry.in_doubt.as_ref().map(|d| d.txn_number) == Some(txn_id.txn_number) {
            if let Some(in_doubt) = entry.in_doubt.take() {
                in_doubt.status.send_replace(status);
                debug!("released in-doubt {} as {:?}", txn_id, status);
            }
        }
    }

    /// Drop a started transaction that never reached the coordinator
    pub fn abort_active(&self, txn_id: &TransactionId) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&txn_id.session_id) {
            Some(entry) if entry.active == Some(txn_id.txn_number) && entry.in_doubt.is_none() => {
                entry.active = None;
                true
            }
            _ => false,
        }
    }

    /// Step-down: fail every blocked waiter and forget in-doubt markers
    pub fn interrupt_all(&self) {
        let mut sessions = self.sessions.lock();
        let mut interrupted = 0;
        for entry in sessions.values_mut() {
            if let Some(in_doubt) = entry.in_doubt.take() {
                in_doubt.status.send_replace(InDoubtStatus::Interrupted);
                interrupted += 1;
            }
            entry.active = None;
        }
        if interrupted > 0 {
            warn!("interrupted {} in-doubt sessions on step-down", interrupted);
        }
    }

    pub fn snapshot(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        self.sessions.lock().get(session_id).map(|entry| SessionSnapshot {
            highest: entry.highest,
            active: entry.active,
            in_doubt: entry.in_doubt.as_ref().map(|d| d.txn_number),
        })
    }

    pub fn in_doubt_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|entry| entry.in_doubt.is_some())
            .count()
    }

    async fn wait_released(
        mut status: watch::Receiver<InDoubtStatus>,
        txn_id: &TransactionId,
    ) -> CoordinatorResult<()> {
        let outcome = match status.wait_for(|s| *s != InDoubtStatus::Pending).await {
            Ok(current) => *current,
            // Sender dropped without a status; re-inspect the session
            Err(_) => InDoubtStatus::Resolved,
        };
        match outcome {
            InDoubtStatus::Interrupted => Err(CoordinatorError::Interrupted {
                txn_id: *txn_id,
                reason: "the session's in-doubt transaction was interrupted".to_string(),
            }),
            _ => Ok(()),
        }
    }
}
