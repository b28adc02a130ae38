// CROSS-SHARD COMMIT COORDINATION
// Participant Client - prepare/commit/abort RPCs to one shard
//
// SAFETY INVARIANTS:
// 1. Every error is classified (retryable / stale / terminal)
// 2. Classification only matters while preparing; delivery retries everything
// 3. Commands are idempotent on the participant side

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use txcoord_core::{
    ParticipantCommand, ParticipantError, ParticipantReply, ShardId, Timestamp, TransactionId,
    Vote,
};

/// Uniform capability every participant shard exposes to the coordinator
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    async fn prepare(&self, shard: &ShardId, txn_id: &TransactionId) -> Result<Vote, ParticipantError>;

    async fn commit(
        &self,
        shard: &ShardId,
        txn_id: &TransactionId,
        commit_timestamp: Timestamp,
    ) -> Result<(), ParticipantError>;

    async fn abort(&self, shard: &ShardId, txn_id: &TransactionId) -> Result<(), ParticipantError>;
}

/// Transport failure below the command layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError(pub String);

/// Sends one JSON command body to a shard and returns its JSON reply
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn run_command(&self, shard: &ShardId, body: Value) -> Result<Value, TransportError>;
}

#[async_trait]
impl<T: CommandTransport + ?Sized> CommandTransport for Arc<T> {
    async fn run_command(&self, shard: &ShardId, body: Value) -> Result<Value, TransportError> {
        (**self).run_command(shard, body).await
    }
}

/// Participant client speaking JSON commands over a transport
pub struct RemoteParticipantClient<T> {
    transport: T,
}

impl<T: CommandTransport> RemoteParticipantClient<T> {
    pub fn new(transport: T) -> Self {
        RemoteParticipantClient { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn send(
        &self,
        shard: &ShardId,
        command: ParticipantCommand,
    ) -> Result<ParticipantReply, ParticipantError> {
        let name = command.name();
        let body = serde_json::to_value(&command).map_err(|e| ParticipantError::MalformedReply {
            shard: shard.clone(),
            reason: format!("cannot encode {}: {}", name, e),
        })?;

        debug!("-> {} {} {}", shard, name, body);
        let reply = self
            .transport
            .run_command(shard, body)
            .await
            .map_err(|e| ParticipantError::Transport {
                shard: shard.clone(),
                reason: e.0,
            })?;
        debug!("<- {} {} {}", shard, name, reply);

        serde_json::from_value(reply).map_err(|e| ParticipantError::MalformedReply {
            shard: shard.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl<T: CommandTransport> ParticipantClient for RemoteParticipantClient<T> {
    async fn prepare(&self, shard: &ShardId, txn_id: &TransactionId) -> Result<Vote, ParticipantError> {
        self.send(shard, ParticipantCommand::prepare(txn_id))
            .await?
            .into_vote(shard)
    }

    async fn commit(
        &self,
        shard: &ShardId,
        txn_id: &TransactionId,
        commit_timestamp: Timestamp,
    ) -> Result<(), ParticipantError> {
        self.send(shard, ParticipantCommand::commit(txn_id, commit_timestamp))
            .await?
            .into_ack(shard)
    }

    async fn abort(&self, shard: &ShardId, txn_id: &TransactionId) -> Result<(), ParticipantError> {
        self.send(shard, ParticipantCommand::abort(txn_id))
            .await?
            .into_ack(shard)
    }
}

/// Capped exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            next: initial,
            max: max.max(initial),
            attempts: 0,
        }
    }

    /// Delay before the next attempt; doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(self.max);
        self.attempts += 1;

        let jitter_ms = (base.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use proptest::prelude::*;
    use serde_json::json;
    use txcoord_core::{ErrorClass, ErrorCode, SessionId};

    fn txn() -> TransactionId {
        TransactionId::new(SessionId::from_bytes([4u8; 16]), 9)
    }

    #[tokio::test]
    async fn test_prepare_decodes_commit_vote() {
        let mut transport = MockCommandTransport::new();
        transport
            .expect_run_command()
            .withf(|shard, body| shard.as_str() == "s1" && body["command"] == "prepareTransaction")
            .times(1)
            .returning(|_, _| Ok(json!({"ok": true, "prepareTimestamp": 42})));

        let client = RemoteParticipantClient::new(transport);
        let vote = client.prepare(&ShardId::new("s1"), &txn()).await.unwrap();
        assert_eq!(vote, Vote::Commit { prepare_timestamp: Timestamp(42) });
    }

    #[tokio::test]
    async fn test_transport_failure_is_retryable() {
        let mut transport = MockCommandTransport::new();
        transport
            .expect_run_command()
            .returning(|_, _| Err(TransportError("connection refused".into())));

        let client = RemoteParticipantClient::new(transport);
        let err = client
            .commit(&ShardId::new("s2"), &txn(), Timestamp(3))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Retryable);
    }

    #[tokio::test]
    async fn test_command_error_keeps_code() {
        let mut transport = MockCommandTransport::new();
        transport
            .expect_run_command()
            .with(eq(ShardId::new("s3")), mockall::predicate::always())
            .returning(|_, _| Ok(json!({"ok": false, "codeName": "NoSuchTransaction", "errmsg": "gone"})));

        let client = RemoteParticipantClient::new(transport);
        let err = client.abort(&ShardId::new("s3"), &txn()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NoSuchTransaction));
        assert_eq!(err.class(), ErrorClass::Terminal);
    }

    #[tokio::test]
    async fn test_garbage_reply_is_malformed() {
        let mut transport = MockCommandTransport::new();
        transport
            .expect_run_command()
            .returning(|_, _| Ok(json!("not a document")));

        let client = RemoteParticipantClient::new(transport);
        let err = client.prepare(&ShardId::new("s1"), &txn()).await.unwrap_err();
        assert!(matches!(err, ParticipantError::MalformedReply { .. }));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(8), Duration::from_millis(20));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(8) && first <= Duration::from_millis(10));

        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(16) && second <= Duration::from_millis(20));

        for _ in 0..5 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(25));
        }
        assert_eq!(backoff.attempts(), 7);
    }

    proptest! {
        #[test]
        fn prop_backoff_stays_within_bounds(
            initial in 1u64..50,
            extra in 0u64..500,
            steps in 1usize..40,
        ) {
            let max = initial + extra;
            let mut backoff = Backoff::new(Duration::from_millis(initial), Duration::from_millis(max));
            for _ in 0..steps {
                let delay = backoff.next_delay();
                prop_assert!(delay >= Duration::from_millis(initial));
                prop_assert!(delay <= Duration::from_millis(max + max / 4));
            }
        }
    }
}
