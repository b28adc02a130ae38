pub mod commands;
pub mod config;
pub mod decision;
pub mod error;
pub mod ids;

pub use commands::{
    CoordinatorCommand, CoordinatorReply, DecisionKind, ParticipantCommand, ParticipantReply,
};
pub use config::CoordinatorConfig;
pub use decision::{decide, CoordinatorDocument, Decision, ParticipantList, Vote};
pub use error::{
    CoordinatorError, CoordinatorResult, DecisionLogError, ErrorClass, ErrorCode, LogResult,
    ParticipantError,
};
pub use ids::{SessionId, ShardId, Timestamp, TransactionId, TxnNumber};
