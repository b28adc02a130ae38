pub mod catalog;
pub mod coordinator;
pub mod decision_log;
pub mod participant_client;
pub mod recovery;
pub mod service;
pub mod session_serializer;
pub mod sim;
pub mod sled_log;

pub use catalog::{Attachment, CoordinatorCatalog};
pub use coordinator::{
    CoordinatorDeps, CoordinatorInstance, CoordinatorProgress, CoordinatorReport,
    CoordinatorState, StartPoint,
};
pub use decision_log::{DecisionLog, InMemoryDecisionLog, InMemoryReplicaSet, LogEntry, OpTime, SessionOutcome};
pub use participant_client::{
    Backoff, CommandTransport, ParticipantClient, RemoteParticipantClient, TransportError,
};
pub use recovery::{RecoveryReport, RecoveryService};
pub use service::{NodeRole, ServiceReport, TransactionCoordinatorService};
pub use session_serializer::{InDoubtStatus, SessionAdmission, SessionSerializer, SessionSnapshot};
pub use sim::{SimCluster, SimOutcome};
pub use sled_log::SledDecisionLog;
