use std::collections::HashSet;

use async_trait::async_trait;
use uuid::Uuid;

use crate::deals::model::{Deal, NewCandidate, ProcessingGroup};

/// Read and write access to deals, their group links, scores and the
/// candidate pool. Writes are ignore-duplicate inserts only.
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn load_deal(&self, deal_id: Uuid) -> anyhow::Result<Option<Deal>>;

    async fn active_groups(&self) -> anyhow::Result<Vec<ProcessingGroup>>;

    async fn linked_groups(&self, deal_id: Uuid) -> anyhow::Result<HashSet<Uuid>>;

    /// Returns the number of links actually created.
    async fn link_groups(&self, deal_id: Uuid, group_ids: &[Uuid]) -> anyhow::Result<u64>;

    /// Whether at least one score row exists for the deal.
    async fn has_result(&self, deal_id: Uuid) -> anyhow::Result<bool>;

    /// Subset of `keys` already present in the candidate pool.
    async fn known_candidates(&self, keys: &[String]) -> anyhow::Result<HashSet<String>>;

    /// Returns the number of rows inserted; conflicts are skipped.
    async fn insert_candidates(&self, candidates: &[NewCandidate]) -> anyhow::Result<u64>;
}
