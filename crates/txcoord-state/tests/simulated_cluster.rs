// End-to-end run of the coordinator service over simulated shards,
// the same wiring the `txcoord simulate` command uses.

use std::sync::Arc;
use tokio_test::{assert_err, assert_ok, block_on};
use txcoord_core::{
    CoordinatorConfig, CoordinatorError, SessionId, ShardId, Timestamp, TransactionId, Vote,
};
use txcoord_state::{
    InMemoryReplicaSet, RemoteParticipantClient, SimCluster, SimOutcome,
    TransactionCoordinatorService,
};

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        backoff_initial_ms: 1,
        backoff_max_ms: 5,
        ..Default::default()
    }
}

#[test]
fn simulate_commit_across_three_shards() {
    block_on(async {
        let cluster = SimCluster::with_commit_votes(&[("shard0", 100), ("shard1", 101), ("shard2", 102)]);
        let replica_set = InMemoryReplicaSet::new();
        cluster.attach_durability_monitor(replica_set.clone());

        let service = TransactionCoordinatorService::new(
            Arc::new(RemoteParticipantClient::new(cluster.clone())),
            config(),
        );
        assert_ok!(service.on_step_up(Arc::new(replica_set.elect_primary())).await);

        let txn_id = TransactionId::new(SessionId::new(), 1);
        let decision = assert_ok!(service.coordinate_commit(&txn_id, cluster.shard_ids(), None).await);
        assert_eq!(decision.commit_timestamp(), Some(Timestamp(102)));

        service.catalog().join().await;
        for shard in ["shard0", "shard1", "shard2"] {
            assert_eq!(cluster.outcome(shard, &txn_id), Some(SimOutcome::Committed(Timestamp(102))));
        }
        assert_eq!(cluster.violations(), 0);
    });
}

#[test]
fn simulate_abort_vote_is_reported_to_commit_caller() {
    block_on(async {
        let cluster = SimCluster::with_commit_votes(&[("shard0", 100)]);
        cluster.add_shard(
            "shard1",
            Vote::Abort {
                reason: "simulated conflict".to_string(),
            },
        );
        let replica_set = InMemoryReplicaSet::new();
        let service = TransactionCoordinatorService::new(
            Arc::new(RemoteParticipantClient::new(cluster.clone())),
            config(),
        );
        assert_ok!(service.on_step_up(Arc::new(replica_set.elect_primary())).await);

        let txn_id = TransactionId::new(SessionId::new(), 1);
        let participants = vec![ShardId::new("shard0"), ShardId::new("shard1")];
        let err = assert_err!(service.commit_transaction(&txn_id, Some(participants), None).await);
        assert!(matches!(err, CoordinatorError::TransactionAborted { .. }));

        service.catalog().join().await;
        assert_eq!(cluster.outcome("shard0", &txn_id), Some(SimOutcome::Aborted));
    });
}
