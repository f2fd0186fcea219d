pub mod memory;
pub mod model;
pub mod repo;
pub mod store;

pub use memory::MemoryDealStore;
pub use model::{candidate_key, Deal, NewCandidate, ProcessingGroup, Provenance};
pub use repo::DealsRepo;
pub use store::DealStore;
