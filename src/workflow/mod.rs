pub mod pacing;
pub mod worker;

pub use pacing::Pacer;
pub use worker::{
    BatchProgress, Worker, WorkerDeps, WorkerExit, WorkerReport, WorkerSettings, WorkerSlot,
    WorkerStats,
};
