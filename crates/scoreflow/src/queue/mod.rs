pub mod client;
pub mod memory;
pub mod model;
pub mod repo;
pub mod store;
pub mod trigger;

pub use client::{EnqueueError, EnqueueReport, WorkQueue};
pub use memory::MemoryQueueStore;
pub use model::{
    EnqueuePolicy, QueueItem, QueueStatus, StatusCounts, TargetKey, ENRICHMENT_QUEUE,
    SCORING_QUEUE,
};
pub use repo::QueueRepo;
pub use store::QueueStore;
pub use trigger::{HttpWorkerTrigger, NoopTrigger, TriggerSummary, WorkerTrigger};
