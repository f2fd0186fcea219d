pub mod memory;
pub mod model;
pub mod repo;
pub mod store;

pub use memory::MemoryLedgerStore;
pub use model::{
    MajorOperation, MajorOperationRequest, OperationHandle, OperationStatus, BULK_ENRICH,
    BULK_SCORE,
};
pub use repo::LedgerRepo;
pub use store::LedgerStore;
