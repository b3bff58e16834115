pub mod coordinator;
pub mod fingerprint;
pub mod key;
pub mod lease;
pub mod publisher;
pub mod reaper;
pub mod record;
pub mod storage;

pub use coordinator::{
    BackoffPolicy, CoordinatorConfig, CoordinatorStats, Decision, ExecuteRequest, ExecutionGrant,
    IdempotencyCoordinator, StatsSnapshot,
};
pub use fingerprint::{Fingerprint, FingerprintEngine, NormalizedRequest};
pub use key::IdempotencyKey;
pub use lease::{
    InMemoryLeaseStore, Lease, LeaseAcquisition, LeaseHeartbeat, LeaseStatus, LeaseStore, LeaseToken,
    RedisLeaseStore,
};
pub use publisher::{CheckpointOutcome, GuardedExecution, PublishOutcome, ResultPublisher};
pub use reaper::RecordReaper;
pub use record::{
    IdempotencyRecord, NewRecord, OutcomeState, RecordState, RequestAudit, StoredOutcome, StoredResponse,
};
pub use storage::{CompletionOutcome, CreateOutcome, InMemoryRecordStore, PostgresRecordStore, RecordStore};
