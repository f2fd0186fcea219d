use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ledger::model::{MajorOperation, MajorOperationRequest, OperationStatus};
use crate::ledger::store::LedgerStore;

/// In-process ledger. The mutex stands in for the partial unique index, so
/// the single-running-slot check and the insert are one step here too.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    // insertion order doubles as creation order
    ops: Vec<MajorOperation>,
    fail_writes: bool,
    fail_finishes: usize,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every insert and update fail until reset.
    pub async fn fail_writes(&self, fail: bool) {
        self.state.lock().await.fail_writes = fail;
    }

    /// Make the next `n` terminal transitions fail.
    pub async fn fail_finishes(&self, n: usize) {
        self.state.lock().await.fail_finishes = n;
    }

    pub async fn snapshot(&self) -> Vec<MajorOperation> {
        self.state.lock().await.ops.clone()
    }

    fn build(req: &MajorOperationRequest, status: OperationStatus) -> MajorOperation {
        let now = Utc::now();
        MajorOperation {
            id: Uuid::new_v4(),
            operation_type: req.operation_type.clone(),
            total_items: req.total_items.max(0),
            completed_items: 0,
            status,
            description: req.description.clone(),
            owner: req.owner.clone(),
            context: req.context.clone(),
            created_at: now,
            started_at: (status == OperationStatus::Running).then_some(now),
            finished_at: None,
        }
    }
}

impl State {
    fn check_writable(&self) -> anyhow::Result<()> {
        if self.fail_writes {
            anyhow::bail!("injected ledger write failure");
        }
        Ok(())
    }

    fn has_running(&self) -> bool {
        self.ops.iter().any(|o| o.status == OperationStatus::Running)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_running_if_idle(
        &self,
        req: &MajorOperationRequest,
    ) -> anyhow::Result<Option<MajorOperation>> {
        let mut st = self.state.lock().await;
        st.check_writable()?;
        if st.has_running() {
            return Ok(None);
        }
        let op = Self::build(req, OperationStatus::Running);
        st.ops.push(op.clone());
        Ok(Some(op))
    }

    async fn insert_queued(&self, req: &MajorOperationRequest) -> anyhow::Result<MajorOperation> {
        let mut st = self.state.lock().await;
        st.check_writable()?;
        let op = Self::build(req, OperationStatus::Queued);
        st.ops.push(op.clone());
        Ok(op)
    }

    async fn promote_oldest_queued(&self) -> anyhow::Result<Option<MajorOperation>> {
        let mut st = self.state.lock().await;
        st.check_writable()?;
        if st.has_running() {
            return Ok(None);
        }
        let Some(op) = st
            .ops
            .iter_mut()
            .find(|o| o.status == OperationStatus::Queued)
        else {
            return Ok(None);
        };
        op.status = OperationStatus::Running;
        op.started_at = Some(Utc::now());
        Ok(Some(op.clone()))
    }

    async fn raise_progress(&self, id: Uuid, completed_items: i32) -> anyhow::Result<bool> {
        let mut st = self.state.lock().await;
        st.check_writable()?;
        match st.ops.iter_mut().find(|o| o.id == id) {
            Some(op) if completed_items > op.completed_items => {
                op.completed_items = completed_items;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(&self, id: Uuid, status: OperationStatus) -> anyhow::Result<bool> {
        if !status.is_terminal() {
            anyhow::bail!("finish requires a terminal status, got {}", status.as_str());
        }
        let mut st = self.state.lock().await;
        st.check_writable()?;
        if st.fail_finishes > 0 {
            st.fail_finishes -= 1;
            anyhow::bail!("injected finish failure");
        }
        match st.ops.iter_mut().find(|o| o.id == id) {
            Some(op) if !op.status.is_terminal() => {
                op.status = status;
                op.finished_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<MajorOperation>> {
        let st = self.state.lock().await;
        Ok(st.ops.iter().find(|o| o.id == id).cloned())
    }

    async fn running(&self) -> anyhow::Result<Option<MajorOperation>> {
        let st = self.state.lock().await;
        Ok(st
            .ops
            .iter()
            .find(|o| o.status == OperationStatus::Running)
            .cloned())
    }

    async fn list(
        &self,
        status: Option<OperationStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<MajorOperation>> {
        let st = self.state.lock().await;
        let limit = limit.clamp(1, 500) as usize;
        Ok(st
            .ops
            .iter()
            .rev()
            .filter(|o| status.map_or(true, |s| o.status == s))
            .take(limit)
            .cloned()
            .collect())
    }
}
