use async_trait::async_trait;
use uuid::Uuid;

use crate::queue::model::{EnqueuePolicy, QueueItem, StatusCounts, TargetKey};

/// Durable work-queue table, keyed by `(queue, target_key)`.
///
/// Writes are conditional upserts; several callers may hold the same rows at
/// once. The claim/finish methods are the worker side of the contract.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Upsert one chunk of keys in a single round-trip. `keys` must already be
    /// free of duplicates. Returns rows inserted or reset.
    async fn upsert(&self, queue: &str, keys: &[TargetKey], policy: EnqueuePolicy)
        -> anyhow::Result<u64>;

    async fn get(&self, queue: &str, key: &TargetKey) -> anyhow::Result<Option<QueueItem>>;

    async fn list_for_entity(&self, queue: &str, entity_id: Uuid) -> anyhow::Result<Vec<QueueItem>>;

    /// Pending + processing rows for an entity.
    async fn count_outstanding(&self, queue: &str, entity_id: Uuid) -> anyhow::Result<i64>;

    async fn count_by_status(&self, queue: &str, keys: &[TargetKey]) -> anyhow::Result<StatusCounts>;

    /// Claim up to `limit` pending rows, oldest first, flipping them to
    /// processing and bumping `attempts`.
    async fn claim_batch(&self, queue: &str, limit: i64) -> anyhow::Result<Vec<QueueItem>>;

    async fn mark_completed(&self, item_id: Uuid) -> anyhow::Result<()>;

    async fn mark_failed(&self, item_id: Uuid, error: &str) -> anyhow::Result<()>;
}
