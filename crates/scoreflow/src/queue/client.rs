use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::queue::model::{EnqueuePolicy, TargetKey};
use crate::queue::store::QueueStore;
use crate::queue::trigger::{TriggerSummary, WorkerTrigger};

pub const DEFAULT_ENQUEUE_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnqueueReport {
    /// Distinct keys submitted after in-memory dedupe.
    pub submitted: usize,
    /// Rows inserted or reset by the store.
    pub enqueued: u64,
    /// Present when the worker trigger answered.
    pub trigger: Option<TriggerSummary>,
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// A chunk failed. Keys before `committed` (in deduped submission order)
    /// were written; the failing chunk and everything after it were not.
    #[error("enqueue into {queue} failed after {committed} of {submitted} keys: {source}")]
    Chunk {
        queue: String,
        committed: usize,
        submitted: usize,
        enqueued: u64,
        #[source]
        source: anyhow::Error,
    },
}

impl EnqueueError {
    pub fn committed(&self) -> usize {
        match self {
            EnqueueError::Chunk { committed, .. } => *committed,
        }
    }

    pub fn enqueued(&self) -> u64 {
        match self {
            EnqueueError::Chunk { enqueued, .. } => *enqueued,
        }
    }
}

/// Client side of the work queue: dedupe, chunked upsert, best-effort kick.
#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn QueueStore>,
    trigger: Arc<dyn WorkerTrigger>,
    batch_size: usize,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn QueueStore>, trigger: Arc<dyn WorkerTrigger>) -> Self {
        Self {
            store,
            trigger,
            batch_size: DEFAULT_ENQUEUE_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Idempotently enqueue `keys` into `queue`.
    ///
    /// Duplicate keys collapse to one row. Chunks go out sequentially; the
    /// first failing chunk stops the rest. When anything new landed, the
    /// worker is kicked once and a kick failure is only logged.
    pub async fn enqueue(
        &self,
        queue: &str,
        keys: &[TargetKey],
        policy: EnqueuePolicy,
    ) -> Result<EnqueueReport, EnqueueError> {
        let unique = dedupe(keys);
        let submitted = unique.len();

        let mut committed = 0usize;
        let mut enqueued = 0u64;
        for (batch_no, chunk) in unique.chunks(self.batch_size).enumerate() {
            match self.store.upsert(queue, chunk, policy).await {
                Ok(n) => {
                    committed += chunk.len();
                    enqueued += n;
                }
                Err(source) => {
                    tracing::warn!(
                        queue,
                        batch = batch_no,
                        committed,
                        submitted,
                        error = %source,
                        "enqueue chunk failed; remaining chunks skipped"
                    );
                    return Err(EnqueueError::Chunk {
                        queue: queue.to_string(),
                        committed,
                        submitted,
                        enqueued,
                        source,
                    });
                }
            }
        }

        let trigger = if enqueued > 0 {
            self.kick(queue).await
        } else {
            None
        };

        tracing::debug!(queue, submitted, enqueued, "enqueue complete");
        Ok(EnqueueReport {
            submitted,
            enqueued,
            trigger,
        })
    }

    /// Invoke the worker trigger, swallowing failures.
    pub async fn kick(&self, queue: &str) -> Option<TriggerSummary> {
        match self.trigger.invoke(queue).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                tracing::warn!(queue, error = %e, "worker trigger failed; scheduled sweep will drain");
                None
            }
        }
    }
}

/// Order-preserving dedupe.
fn dedupe(keys: &[TargetKey]) -> Vec<TargetKey> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter().copied().filter(|k| seen.insert(*k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryQueueStore;
    use crate::queue::trigger::NoopTrigger;
    use uuid::Uuid;

    #[test]
    fn dedupe_keeps_first_occurrence_order() {
        let a = TargetKey::entity(Uuid::new_v4());
        let b = TargetKey::entity(Uuid::new_v4());
        assert_eq!(dedupe(&[a, b, a, a, b]), vec![a, b]);
    }

    #[tokio::test]
    async fn chunks_at_batch_size() {
        let store = Arc::new(MemoryQueueStore::new());
        let wq = WorkQueue::new(store.clone(), Arc::new(NoopTrigger)).with_batch_size(3);

        let keys: Vec<TargetKey> = (0..7).map(|_| TargetKey::entity(Uuid::new_v4())).collect();
        let report = wq
            .enqueue("scoring", &keys, EnqueuePolicy::Requeue)
            .await
            .unwrap();

        assert_eq!(report.submitted, 7);
        assert_eq!(report.enqueued, 7);
        assert_eq!(store.upsert_calls().await, 3);
    }

    #[tokio::test]
    async fn failing_chunk_reports_committed_prefix() {
        let store = Arc::new(MemoryQueueStore::new());
        store.fail_from_call(2).await;
        let wq = WorkQueue::new(store.clone(), Arc::new(NoopTrigger)).with_batch_size(2);

        let keys: Vec<TargetKey> = (0..5).map(|_| TargetKey::entity(Uuid::new_v4())).collect();
        let err = wq
            .enqueue("scoring", &keys, EnqueuePolicy::Requeue)
            .await
            .unwrap_err();

        assert_eq!(err.committed(), 2);
        assert_eq!(err.enqueued(), 2);
        // third chunk never attempted
        assert_eq!(store.upsert_calls().await, 2);
        assert_eq!(store.len().await, 2);
    }
}
