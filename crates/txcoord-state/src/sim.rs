//! Simulated participant shards for exercising the coordinator
//!
//! Each shard answers JSON participant commands from a scripted vote and can be
//! partitioned, made to fail transiently, given injected error codes, or held
//! so its RPCs hang until released. An optional durability monitor checks every
//! commit/abort against the coordinator replica set's majority-committed
//! decision.

use crate::decision_log::InMemoryReplicaSet;
use crate::participant_client::{CommandTransport, TransportError};
use async_trait::async_trait;
use log::{debug, error};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use txcoord_core::{
    ErrorCode, ParticipantCommand, ParticipantReply, ShardId, Timestamp, TransactionId, Vote,
};

/// What a simulated shard did with a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOutcome {
    Committed(Timestamp),
    Aborted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Hold {
    all: bool,
    delivery: bool,
}

struct SimShard {
    vote: Vote,
    prepared: HashMap<TransactionId, Vote>,
    outcomes: HashMap<TransactionId, SimOutcome>,
    transient_failures: u32,
    injected: HashMap<&'static str, VecDeque<ErrorCode>>,
    partitioned: bool,
    journal: Vec<ParticipantCommand>,
    hold: watch::Sender<Hold>,
}

impl SimShard {
    fn new(vote: Vote) -> Self {
        let (hold, _) = watch::channel(Hold::default());
        SimShard {
            vote,
            prepared: HashMap::new(),
            outcomes: HashMap::new(),
            transient_failures: 0,
            injected: HashMap::new(),
            partitioned: false,
            journal: Vec::new(),
            hold,
        }
    }
}

/// A set of in-process participant shards
#[derive(Default)]
pub struct SimCluster {
    shards: Mutex<BTreeMap<ShardId, SimShard>>,
    monitor: Mutex<Option<Arc<InMemoryReplicaSet>>>,
    violations: AtomicUsize,
}

impl SimCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(SimCluster::default())
    }

    /// Shards that all vote commit at the given prepare timestamps
    pub fn with_commit_votes(shards: &[(&str, u64)]) -> Arc<Self> {
        let cluster = SimCluster::new();
        for (name, ts) in shards {
            cluster.add_shard(
                *name,
                Vote::Commit {
                    prepare_timestamp: Timestamp(*ts),
                },
            );
        }
        cluster
    }

    pub fn add_shard(&self, name: impl Into<String>, vote: Vote) {
        self.shards
            .lock()
            .insert(ShardId::new(name), SimShard::new(vote));
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.lock().keys().cloned().collect()
    }

    pub fn set_vote(&self, shard: &str, vote: Vote) {
        self.with_shard(shard, |s| s.vote = vote);
    }

    /// The next `count` commands to `shard` fail at the transport
    pub fn fail_next(&self, shard: &str, count: u32) {
        self.with_shard(shard, |s| s.transient_failures = count);
    }

    /// The next `times` `command` RPCs to `shard` reply with `code`
    pub fn inject_error(&self, shard: &str, command: &'static str, code: ErrorCode, times: usize) {
        self.with_shard(shard, |s| {
            s.injected
                .entry(command)
                .or_default()
                .extend(std::iter::repeat(code).take(times))
        });
    }

    pub fn partition(&self, shard: &str) {
        self.with_shard(shard, |s| s.partitioned = true);
    }

    pub fn heal(&self, shard: &str) {
        self.with_shard(shard, |s| s.partitioned = false);
    }

    /// Every RPC to `shard` hangs until `release`
    pub fn hold(&self, shard: &str) {
        self.with_shard(shard, |s| {
            s.hold.send_modify(|h| h.all = true);
        });
    }

    /// commit/abort RPCs to `shard` hang until `release`; prepares still answer
    pub fn hold_delivery(&self, shard: &str) {
        self.with_shard(shard, |s| {
            s.hold.send_modify(|h| h.delivery = true);
        });
    }

    pub fn release(&self, shard: &str) {
        self.with_shard(shard, |s| {
            s.hold.send_replace(Hold::default());
        });
    }

    pub fn hold_all_delivery(&self) {
        for shard in self.shards.lock().values() {
            shard.hold.send_modify(|h| h.delivery = true);
        }
    }

    pub fn release_all(&self) {
        for shard in self.shards.lock().values() {
            shard.hold.send_replace(Hold::default());
        }
    }

    /// Count commit/abort RPCs that arrive before their decision is majority-committed
    pub fn attach_durability_monitor(&self, replica_set: Arc<InMemoryReplicaSet>) {
        *self.monitor.lock() = Some(replica_set);
    }

    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    /// Commands `shard` processed, oldest first
    pub fn received(&self, shard: &str) -> Vec<ParticipantCommand> {
        self.shards
            .lock()
            .get(&ShardId::new(shard))
            .map(|s| s.journal.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, shard: &str, command: &str) -> usize {
        self.received(shard)
            .iter()
            .filter(|c| c.name() == command)
            .count()
    }

    pub fn outcome(&self, shard: &str, txn_id: &TransactionId) -> Option<SimOutcome> {
        self.shards
            .lock()
            .get(&ShardId::new(shard))
            .and_then(|s| s.outcomes.get(txn_id).copied())
    }

    fn with_shard(&self, shard: &str, apply: impl FnOnce(&mut SimShard)) {
        if let Some(s) = self.shards.lock().get_mut(&ShardId::new(shard)) {
            apply(s);
        }
    }

    fn check_durable(&self, shard: &ShardId, txn_id: &TransactionId, commit: bool) {
        let monitor = self.monitor.lock().clone();
        let Some(replica_set) = monitor else {
            return;
        };
        let durable = replica_set
            .majority_committed_decision(txn_id)
            .is_some_and(|decision| decision.is_commit() == commit);
        if !durable {
            self.violations.fetch_add(1, Ordering::SeqCst);
            error!(
                "shard {} received {} for {} before the decision was majority-committed",
                shard,
                if commit { "commit" } else { "abort" },
                txn_id
            );
        }
    }

    fn apply(&self, shard_id: &ShardId, command: ParticipantCommand) -> Result<ParticipantReply, TransportError> {
        let txn_id = command.txn_id();
        if matches!(command, ParticipantCommand::CommitTransaction { .. }) {
            self.check_durable(shard_id, &txn_id, true);
        } else if matches!(command, ParticipantCommand::AbortTransaction { .. }) {
            self.check_durable(shard_id, &txn_id, false);
        }

        let mut shards = self.shards.lock();
        let shard = shards
            .get_mut(shard_id)
            .ok_or_else(|| TransportError(format!("unknown shard {}", shard_id)))?;

        if shard.partitioned {
            return Err(TransportError(format!("shard {} is partitioned", shard_id)));
        }
        if shard.transient_failures > 0 {
            shard.transient_failures -= 1;
            return Err(TransportError(format!("connection to {} reset", shard_id)));
        }

        shard.journal.push(command.clone());
        if let Some(code) = shard.injected.get_mut(command.name()).and_then(|q| q.pop_front()) {
            return Ok(ParticipantReply::error(code, "injected"));
        }

        let reply = match command {
            ParticipantCommand::PrepareTransaction { .. } => {
                if shard.outcomes.get(&txn_id) == Some(&SimOutcome::Aborted) {
                    ParticipantReply::error(ErrorCode::NoSuchTransaction, "transaction was aborted")
                } else {
                    // A repeated prepare answers with the original vote
                    let scripted = shard.vote.clone();
                    let vote = shard.prepared.entry(txn_id).or_insert(scripted);
                    ParticipantReply::from_vote(vote)
                }
            }
            ParticipantCommand::CommitTransaction { commit_timestamp, .. } => {
                shard.outcomes.insert(txn_id, SimOutcome::Committed(commit_timestamp));
                ParticipantReply::ack()
            }
            ParticipantCommand::AbortTransaction { .. } => {
                shard.prepared.remove(&txn_id);
                shard.outcomes.insert(txn_id, SimOutcome::Aborted);
                ParticipantReply::ack()
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl CommandTransport for SimCluster {
    async fn run_command(&self, shard: &ShardId, body: Value) -> Result<Value, TransportError> {
        let command: ParticipantCommand = serde_json::from_value(body)
            .map_err(|e| TransportError(format!("undecodable command: {}", e)))?;
        let delivery = !matches!(command, ParticipantCommand::PrepareTransaction { .. });

        let hold = self
            .shards
            .lock()
            .get(shard)
            .map(|s| s.hold.subscribe())
            .ok_or_else(|| TransportError(format!("unknown shard {}", shard)))?;
        let mut hold = hold;
        hold.wait_for(|h| !h.all && !(delivery && h.delivery))
            .await
            .map_err(|_| TransportError(format!("shard {} shut down", shard)))?;

        debug!("sim shard {} handling {}", shard, command.name());
        let reply = self.apply(shard, command)?;
        serde_json::to_value(reply).map_err(|e| TransportError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txcoord_core::SessionId;

    fn txn() -> TransactionId {
        TransactionId::new(SessionId::from_bytes([3u8; 16]), 1)
    }

    async fn send(cluster: &SimCluster, shard: &str, command: ParticipantCommand) -> Result<ParticipantReply, TransportError> {
        let body = serde_json::to_value(command).unwrap();
        let reply = cluster.run_command(&ShardId::new(shard), body).await?;
        Ok(serde_json::from_value(reply).unwrap())
    }

    #[tokio::test]
    async fn test_repeated_prepare_returns_same_vote() {
        let cluster = SimCluster::with_commit_votes(&[("s1", 5)]);
        let first = send(&cluster, "s1", ParticipantCommand::prepare(&txn())).await.unwrap();

        cluster.set_vote("s1", Vote::Abort { reason: "changed".into() });
        let second = send(&cluster, "s1", ParticipantCommand::prepare(&txn())).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.prepare_timestamp, Some(Timestamp(5)));
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let cluster = SimCluster::with_commit_votes(&[("s1", 5)]);
        cluster.fail_next("s1", 2);

        assert!(send(&cluster, "s1", ParticipantCommand::prepare(&txn())).await.is_err());
        assert!(send(&cluster, "s1", ParticipantCommand::prepare(&txn())).await.is_err());
        assert!(send(&cluster, "s1", ParticipantCommand::prepare(&txn())).await.is_ok());
        assert_eq!(cluster.count("s1", "prepareTransaction"), 1);
    }

    #[tokio::test]
    async fn test_monitor_flags_commit_without_durable_decision() {
        let cluster = SimCluster::with_commit_votes(&[("s1", 5)]);
        cluster.attach_durability_monitor(InMemoryReplicaSet::new());

        send(&cluster, "s1", ParticipantCommand::commit(&txn(), Timestamp(5)))
            .await
            .unwrap();
        assert_eq!(cluster.violations(), 1);
        assert_eq!(cluster.outcome("s1", &txn()), Some(SimOutcome::Committed(Timestamp(5))));
    }

    #[tokio::test]
    async fn test_injected_error_is_returned_once() {
        let cluster = SimCluster::with_commit_votes(&[("s1", 5)]);
        cluster.inject_error("s1", "prepareTransaction", ErrorCode::StaleConfig, 1);

        let reply = send(&cluster, "s1", ParticipantCommand::prepare(&txn())).await.unwrap();
        assert_eq!(reply.code_name, Some(ErrorCode::StaleConfig));
        let reply = send(&cluster, "s1", ParticipantCommand::prepare(&txn())).await.unwrap();
        assert!(reply.ok);
    }
}
