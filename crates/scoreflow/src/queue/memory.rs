use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::queue::model::{EnqueuePolicy, QueueItem, QueueStatus, StatusCounts, TargetKey};
use crate::queue::store::QueueStore;

/// In-process queue table with the same upsert semantics as [`QueueRepo`].
///
/// Failure injection hooks let callers exercise partial-failure paths.
///
/// [`QueueRepo`]: crate::queue::QueueRepo
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    items: BTreeMap<(String, TargetKey), QueueItem>,
    upsert_calls: usize,
    fail_scopes: HashSet<Uuid>,
    fail_from_call: Option<usize>,
    fail_reads: bool,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upsert whose chunk touches `scope_id` fails.
    pub async fn fail_scope(&self, scope_id: Uuid) {
        self.state.lock().await.fail_scopes.insert(scope_id);
    }

    /// Upsert calls numbered `call_no` and later (1-based) fail.
    pub async fn fail_from_call(&self, call_no: usize) {
        self.state.lock().await.fail_from_call = Some(call_no);
    }

    pub async fn fail_reads(&self, fail: bool) {
        self.state.lock().await.fail_reads = fail;
    }

    pub async fn upsert_calls(&self) -> usize {
        self.state.lock().await.upsert_calls
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every row, in key order.
    pub async fn items(&self) -> Vec<QueueItem> {
        self.state.lock().await.items.values().cloned().collect()
    }

    /// Force a row into `status`, standing in for a worker.
    pub async fn set_status(&self, queue: &str, key: &TargetKey, status: QueueStatus) -> bool {
        let mut st = self.state.lock().await;
        match st.items.get_mut(&(queue.to_string(), *key)) {
            Some(item) => {
                item.status = status;
                if matches!(status, QueueStatus::Completed | QueueStatus::Failed) {
                    item.completed_at = Some(Utc::now());
                }
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn upsert(
        &self,
        queue: &str,
        keys: &[TargetKey],
        policy: EnqueuePolicy,
    ) -> anyhow::Result<u64> {
        let mut st = self.state.lock().await;
        st.upsert_calls += 1;

        if st.fail_from_call.is_some_and(|n| st.upsert_calls >= n) {
            anyhow::bail!("injected upsert failure on call {}", st.upsert_calls);
        }
        if keys
            .iter()
            .any(|k| k.scope_id.is_some_and(|s| st.fail_scopes.contains(&s)))
        {
            anyhow::bail!("injected upsert failure for scope");
        }

        let now = Utc::now();
        let mut affected = 0u64;
        for key in keys {
            let slot = (queue.to_string(), *key);
            match st.items.get_mut(&slot) {
                Some(item) => {
                    let reset = match policy {
                        EnqueuePolicy::Requeue => item.status != QueueStatus::Processing,
                        EnqueuePolicy::FillGaps => item.status == QueueStatus::Failed,
                    };
                    if reset {
                        item.status = QueueStatus::Pending;
                        item.attempts = 0;
                        item.queued_at = now;
                        item.started_at = None;
                        item.completed_at = None;
                        item.last_error = None;
                        affected += 1;
                    }
                }
                None => {
                    st.items.insert(
                        slot,
                        QueueItem {
                            id: Uuid::new_v4(),
                            queue: queue.to_string(),
                            target: *key,
                            status: QueueStatus::Pending,
                            attempts: 0,
                            queued_at: now,
                            started_at: None,
                            completed_at: None,
                            last_error: None,
                        },
                    );
                    affected += 1;
                }
            }
        }

        Ok(affected)
    }

    async fn get(&self, queue: &str, key: &TargetKey) -> anyhow::Result<Option<QueueItem>> {
        let st = self.state.lock().await;
        if st.fail_reads {
            anyhow::bail!("injected read failure");
        }
        Ok(st.items.get(&(queue.to_string(), *key)).cloned())
    }

    async fn list_for_entity(&self, queue: &str, entity_id: Uuid) -> anyhow::Result<Vec<QueueItem>> {
        let st = self.state.lock().await;
        if st.fail_reads {
            anyhow::bail!("injected read failure");
        }
        let mut items: Vec<QueueItem> = st
            .items
            .values()
            .filter(|i| i.queue == queue && i.target.entity_id == entity_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.queued_at, i.id));
        Ok(items)
    }

    async fn count_outstanding(&self, queue: &str, entity_id: Uuid) -> anyhow::Result<i64> {
        let st = self.state.lock().await;
        if st.fail_reads {
            anyhow::bail!("injected read failure");
        }
        Ok(st
            .items
            .values()
            .filter(|i| {
                i.queue == queue && i.target.entity_id == entity_id && i.status.is_outstanding()
            })
            .count() as i64)
    }

    async fn count_by_status(&self, queue: &str, keys: &[TargetKey]) -> anyhow::Result<StatusCounts> {
        let st = self.state.lock().await;
        if st.fail_reads {
            anyhow::bail!("injected read failure");
        }
        let mut counts = StatusCounts::default();
        let wanted: HashSet<&TargetKey> = keys.iter().collect();
        for item in st.items.values() {
            if item.queue == queue && wanted.contains(&item.target) {
                counts.add(item.status);
            }
        }
        Ok(counts)
    }

    async fn claim_batch(&self, queue: &str, limit: i64) -> anyhow::Result<Vec<QueueItem>> {
        let mut st = self.state.lock().await;
        let limit = limit.clamp(1, 500) as usize;
        let now = Utc::now();

        let mut pending: Vec<&mut QueueItem> = st
            .items
            .values_mut()
            .filter(|i| i.queue == queue && i.status == QueueStatus::Pending)
            .collect();
        pending.sort_by_key(|i| (i.queued_at, i.id));

        let mut claimed = Vec::new();
        for item in pending.into_iter().take(limit) {
            item.status = QueueStatus::Processing;
            item.attempts += 1;
            item.started_at = Some(now);
            claimed.push(item.clone());
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, item_id: Uuid) -> anyhow::Result<()> {
        let mut st = self.state.lock().await;
        if let Some(item) = st
            .items
            .values_mut()
            .find(|i| i.id == item_id && i.status == QueueStatus::Processing)
        {
            item.status = QueueStatus::Completed;
            item.completed_at = Some(Utc::now());
            item.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, item_id: Uuid, error: &str) -> anyhow::Result<()> {
        let mut st = self.state.lock().await;
        if let Some(item) = st
            .items
            .values_mut()
            .find(|i| i.id == item_id && i.status == QueueStatus::Processing)
        {
            item.status = QueueStatus::Failed;
            item.completed_at = Some(Utc::now());
            item.last_error = Some(error.to_string());
        }
        Ok(())
    }
}
