// Shared harness for coordinator integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use txcoord_core::{CoordinatorConfig, SessionId, ShardId, TransactionId};
use txcoord_state::{
    InMemoryReplicaSet, ParticipantClient, RemoteParticipantClient, SimCluster,
    TransactionCoordinatorService,
};

pub struct Harness {
    pub cluster: Arc<SimCluster>,
    pub replica_set: Arc<InMemoryReplicaSet>,
    pub service: Arc<TransactionCoordinatorService>,
}

pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        backoff_initial_ms: 1,
        backoff_max_ms: 5,
        ..Default::default()
    }
}

pub fn client_for(cluster: &Arc<SimCluster>) -> Arc<dyn ParticipantClient> {
    Arc::new(RemoteParticipantClient::new(cluster.clone()))
}

/// A primary coordinator over `cluster`, with the durability monitor attached
pub async fn primary(cluster: Arc<SimCluster>, config: CoordinatorConfig) -> Harness {
    let replica_set = InMemoryReplicaSet::new();
    cluster.attach_durability_monitor(replica_set.clone());

    let service = TransactionCoordinatorService::new(client_for(&cluster), config);
    service
        .on_step_up(Arc::new(replica_set.elect_primary()))
        .await
        .unwrap();

    Harness {
        cluster,
        replica_set,
        service,
    }
}

pub fn session() -> SessionId {
    SessionId::new()
}

pub fn txn(session: SessionId, n: u64) -> TransactionId {
    TransactionId::new(session, n)
}

pub fn shards(names: &[&str]) -> Vec<ShardId> {
    names.iter().map(|n| ShardId::new(*n)).collect()
}

/// Poll `check` until it holds, failing after about five seconds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {}", what);
}
