use async_trait::async_trait;
use uuid::Uuid;

use crate::ledger::model::{MajorOperation, MajorOperationRequest, OperationStatus};

/// Activity ledger. Only conditional inserts, slot-guarded promotion and
/// monotonic updates are exposed; there is no read-modify-write API.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert as `running` only if the single active slot is free.
    async fn insert_running_if_idle(
        &self,
        req: &MajorOperationRequest,
    ) -> anyhow::Result<Option<MajorOperation>>;

    async fn insert_queued(&self, req: &MajorOperationRequest) -> anyhow::Result<MajorOperation>;

    /// Flip the oldest `queued` row to `running` if nothing is running.
    async fn promote_oldest_queued(&self) -> anyhow::Result<Option<MajorOperation>>;

    /// `completed_items = max(completed_items, n)`. Returns whether it moved.
    async fn raise_progress(&self, id: Uuid, completed_items: i32) -> anyhow::Result<bool>;

    /// Terminal transition; returns false if the row was already terminal.
    async fn finish(&self, id: Uuid, status: OperationStatus) -> anyhow::Result<bool>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<MajorOperation>>;

    async fn running(&self) -> anyhow::Result<Option<MajorOperation>>;

    /// Newest first.
    async fn list(
        &self,
        status: Option<OperationStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<MajorOperation>>;
}
