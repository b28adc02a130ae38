// CROSS-SHARD COMMIT COORDINATION
// Decision Model - participant lists, prepare votes, write-once decisions
//
// SAFETY INVARIANTS:
// 1. A participant list is non-empty, duplicate-free and immutable once built
// 2. A commit timestamp is >= every participant's prepare timestamp
// 3. Any abort vote forces an abort decision
// 4. A decision, once set, never changes

use crate::error::CoordinatorError;
use crate::ids::{ShardId, Timestamp, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Ordered, de-duplicated set of participant shards
///
/// SAFETY: Fixed once prepare begins; there is no mutating API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ShardId>", into = "Vec<ShardId>")]
pub struct ParticipantList(Vec<ShardId>);

impl ParticipantList {
    /// Build a participant list, keeping first-seen order and collapsing duplicates
    pub fn new<I>(shards: I) -> Result<Self, CoordinatorError>
    where
        I: IntoIterator<Item = ShardId>,
    {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        for shard in shards {
            if seen.insert(shard.clone()) {
                ordered.push(shard);
            }
        }

        if ordered.is_empty() {
            return Err(CoordinatorError::EmptyParticipantList);
        }
        Ok(ParticipantList(ordered))
    }

    pub fn shards(&self) -> &[ShardId] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, shard: &ShardId) -> bool {
        self.0.contains(shard)
    }

    /// Same membership, ignoring order
    pub fn same_members(&self, other: &ParticipantList) -> bool {
        let mine: BTreeSet<_> = self.0.iter().collect();
        let theirs: BTreeSet<_> = other.0.iter().collect();
        mine == theirs
    }
}

impl TryFrom<Vec<ShardId>> for ParticipantList {
    type Error = CoordinatorError;

    fn try_from(shards: Vec<ShardId>) -> Result<Self, Self::Error> {
        ParticipantList::new(shards)
    }
}

impl From<ParticipantList> for Vec<ShardId> {
    fn from(list: ParticipantList) -> Self {
        list.0
    }
}

/// A participant's answer to `prepareTransaction`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "vote", rename_all = "camelCase")]
pub enum Vote {
    /// Writes are locked in at the given prepare timestamp
    #[serde(rename_all = "camelCase")]
    Commit { prepare_timestamp: Timestamp },

    /// The participant refuses to prepare
    Abort { reason: String },
}

/// Commit-or-abort decision for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum Decision {
    #[serde(rename_all = "camelCase")]
    Commit { commit_timestamp: Timestamp },
    Abort { reason: String },
}

impl Decision {
    pub fn is_commit(&self) -> bool {
        matches!(self, Decision::Commit { .. })
    }

    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        match self {
            Decision::Commit { commit_timestamp } => Some(*commit_timestamp),
            Decision::Abort { .. } => None,
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Decision::Abort {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Commit { commit_timestamp } => write!(f, "commit@{}", commit_timestamp),
            Decision::Abort { reason } => write!(f, "abort({})", reason),
        }
    }
}

/// Derive the decision from a complete set of commit votes
///
/// SAFETY: Only called once every participant has voted commit. The commit
/// timestamp is the maximum prepare timestamp.
pub fn commit_decision_from_votes(votes: &BTreeMap<ShardId, Timestamp>) -> Option<Decision> {
    votes.values().max().map(|ts| Decision::Commit {
        commit_timestamp: *ts,
    })
}

/// Decide from a full vote map: any abort vote wins, otherwise commit at the max timestamp
pub fn decide(votes: &BTreeMap<ShardId, Vote>) -> Option<Decision> {
    let mut timestamps = BTreeMap::new();
    for (shard, vote) in votes {
        match vote {
            Vote::Abort { reason } => {
                return Some(Decision::abort(format!(
                    "shard {} voted abort: {}",
                    shard, reason
                )));
            }
            Vote::Commit { prepare_timestamp } => {
                timestamps.insert(shard.clone(), *prepare_timestamp);
            }
        }
    }
    commit_decision_from_votes(&timestamps)
}

/// Durable per-transaction coordinator record
///
/// Lifecycle: inserted with no decision before the first prepare is sent,
/// decision written exactly once before any commit/abort is sent, deleted
/// after every participant acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorDocument {
    #[serde(rename = "_id")]
    pub txn_id: TransactionId,
    pub participants: ParticipantList,
    pub decision: Option<Decision>,
    pub acknowledged: BTreeSet<ShardId>,
}

impl CoordinatorDocument {
    pub fn new(txn_id: TransactionId, participants: ParticipantList) -> Self {
        CoordinatorDocument {
            txn_id,
            participants,
            decision: None,
            acknowledged: BTreeSet::new(),
        }
    }

    /// Participants that still need the decision delivered
    pub fn unacknowledged(&self) -> Vec<ShardId> {
        self.participants
            .iter()
            .filter(|shard| !self.acknowledged.contains(*shard))
            .cloned()
            .collect()
    }

    pub fn is_fully_acknowledged(&self) -> bool {
        self.decision.is_some() && self.unacknowledged().is_empty()
    }
}
