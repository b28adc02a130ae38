// CROSS-SHARD COMMIT COORDINATION
// Step-up Recovery - resume coordinators left behind by a previous primary
//
// SAFETY INVARIANTS:
// 1. The step-up no-op is majority-committed before any scanned entry is acted on
// 2. Undecided entries restart prepare; decided entries resume delivery only
// 3. Recovery never writes a decision of its own
// 4. Running recovery again on the next primary is always safe

use crate::catalog::{Attachment, CoordinatorCatalog};
use crate::coordinator::{CoordinatorDeps, StartPoint};
use crate::session_serializer::SessionSerializer;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use txcoord_core::{CoordinatorError, CoordinatorResult, Decision};

/// Counts of coordinators resumed by one recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Undecided: prepare starts over
    pub resumed_preparing: usize,
    pub resumed_committing: usize,
    pub resumed_aborting: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.resumed_preparing + self.resumed_committing + self.resumed_aborting
    }
}

/// Rebuilds the catalog from the decision log after promotion
pub struct RecoveryService {
    deps: Arc<CoordinatorDeps>,
    catalog: Arc<CoordinatorCatalog>,
    sessions: Arc<SessionSerializer>,
}

impl RecoveryService {
    pub fn new(
        deps: Arc<CoordinatorDeps>,
        catalog: Arc<CoordinatorCatalog>,
        sessions: Arc<SessionSerializer>,
    ) -> Self {
        RecoveryService {
            deps,
            catalog,
            sessions,
        }
    }

    /// Run one recovery pass for the current term
    ///
    /// SAFETY: `term` is the primary term's cancellation token; every resumed
    /// coordinator stops when it is cancelled.
    pub async fn recover(&self, term: &CancellationToken) -> CoordinatorResult<RecoveryReport> {
        let log = &self.deps.log;

        let noop = log.write_noop("coordinator step-up").await?;
        let documents = log.scan_unfinished().await?;
        info!(
            "step-up scan found {} unfinished coordinators; waiting for no-op {} to majority-commit",
            documents.len(),
            noop
        );

        tokio::select! {
            _ = term.cancelled() => return Err(CoordinatorError::NotPrimary),
            result = log.wait_for_majority(noop) => result?,
        }

        let mut report = RecoveryReport::default();
        for doc in documents {
            if term.is_cancelled() {
                warn!("stepped down mid-recovery after resuming {} coordinators", report.total());
                return Err(CoordinatorError::NotPrimary);
            }

            match &doc.decision {
                None => report.resumed_preparing += 1,
                Some(Decision::Commit { .. }) => report.resumed_committing += 1,
                Some(Decision::Abort { .. }) => report.resumed_aborting += 1,
            }

            let txn_id = doc.txn_id;
            self.sessions.mark_in_doubt_recovered(&txn_id);
            let attachment = self.catalog.create_or_attach(
                txn_id,
                doc.participants.clone(),
                StartPoint::Recovered(doc),
                self.deps.clone(),
                term,
            )?;
            if let Attachment::Attached(_) = attachment {
                warn!("{} already had a live coordinator during recovery", txn_id);
            }
        }

        info!(
            "recovery resumed {} coordinators ({} preparing, {} committing, {} aborting)",
            report.total(),
            report.resumed_preparing,
            report.resumed_committing,
            report.resumed_aborting
        );
        Ok(report)
    }
}
