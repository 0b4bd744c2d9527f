pub mod batch_queue;
pub mod failure_ledger;
pub mod fetcher;
pub mod identity;
pub mod snapshot_store;

pub use batch_queue::{BatchQueue, MemoryBatchQueue, MemoryQueueSender, RedisBatchQueue};
pub use failure_ledger::FailureLedger;
pub use fetcher::{Fetcher, HttpFetcher};
pub use identity::{FingerprintIdentityProvider, HeaderBundle, IdentityProvider};
pub use snapshot_store::{
    InsertOutcome, MemorySnapshotStore, PostgresSnapshotStore, SaveOutcome, SnapshotGate,
    SnapshotStore,
};
