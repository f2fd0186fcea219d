use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::deals::DealStore;
use crate::gate::{AdmissionGate, Registration};
use crate::ledger::{
    MajorOperation, MajorOperationRequest, OperationHandle, OperationStatus, BULK_ENRICH,
    BULK_SCORE,
};
use crate::queue::{
    EnqueuePolicy, StatusCounts, TargetKey, WorkQueue, ENRICHMENT_QUEUE, SCORING_QUEUE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkKind {
    Scoring,
    Enrichment,
}

impl BulkKind {
    pub fn operation_type(&self) -> &'static str {
        match self {
            BulkKind::Scoring => BULK_SCORE,
            BulkKind::Enrichment => BULK_ENRICH,
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            BulkKind::Scoring => SCORING_QUEUE,
            BulkKind::Enrichment => ENRICHMENT_QUEUE,
        }
    }
}

/// Stored as the ledger `context`; enough to redo the enqueue after the
/// operation sat in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkContext {
    pub kind: BulkKind,
    pub deal_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkSubmission {
    pub registration: Registration,
    pub total_items: usize,
}

/// Gated bulk scoring and enrichment.
pub struct BulkOperations {
    gate: AdmissionGate,
    queue: WorkQueue,
    deals: Arc<dyn DealStore>,
    poll_interval: Duration,
    max_polls: u32,
}

impl BulkOperations {
    pub fn new(
        gate: AdmissionGate,
        queue: WorkQueue,
        deals: Arc<dyn DealStore>,
        poll_interval: Duration,
        max_polls: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            gate,
            queue,
            deals,
            poll_interval,
            max_polls,
        })
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Hook both bulk operation types into the gate's auto-start registry.
    /// The callbacks hold a weak reference so the registry does not keep
    /// this value alive.
    pub fn register_autostart(self: &Arc<Self>) {
        for kind in [BulkKind::Scoring, BulkKind::Enrichment] {
            let weak: Weak<Self> = Arc::downgrade(self);
            self.gate
                .autostart()
                .register(kind.operation_type(), move |op: MajorOperation| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let this = weak
                            .upgrade()
                            .ok_or_else(|| anyhow::anyhow!("bulk operations shut down"))?;
                        let ctx: BulkContext = serde_json::from_value(op.context.clone())?;
                        if ctx.kind != kind {
                            anyhow::bail!(
                                "context kind {:?} does not match operation type {}",
                                ctx.kind,
                                op.operation_type
                            );
                        }
                        this.start(Some(op.handle()), ctx);
                        Ok::<(), anyhow::Error>(())
                    })
                });
        }
    }

    pub async fn submit_scoring(
        self: &Arc<Self>,
        deal_ids: Vec<Uuid>,
        owner: &str,
    ) -> anyhow::Result<BulkSubmission> {
        self.submit(BulkKind::Scoring, deal_ids, owner).await
    }

    pub async fn submit_enrichment(
        self: &Arc<Self>,
        deal_ids: Vec<Uuid>,
        owner: &str,
    ) -> anyhow::Result<BulkSubmission> {
        self.submit(BulkKind::Enrichment, deal_ids, owner).await
    }

    async fn submit(
        self: &Arc<Self>,
        kind: BulkKind,
        mut deal_ids: Vec<Uuid>,
        owner: &str,
    ) -> anyhow::Result<BulkSubmission> {
        deal_ids.sort();
        deal_ids.dedup();
        if deal_ids.is_empty() {
            anyhow::bail!("no deals selected");
        }

        let ctx = BulkContext { kind, deal_ids };
        let total_items = self.keys_for(&ctx).await?.len();
        if total_items == 0 {
            anyhow::bail!("no active processing groups to score against");
        }

        let description = match kind {
            BulkKind::Scoring => format!("Score {} deals ({total_items} items)", ctx.deal_ids.len()),
            BulkKind::Enrichment => format!("Enrich {} deals", ctx.deal_ids.len()),
        };
        let req = MajorOperationRequest {
            operation_type: kind.operation_type().to_string(),
            total_items: i32::try_from(total_items).unwrap_or(i32::MAX),
            description,
            owner: owner.to_string(),
            context: serde_json::to_value(&ctx)?,
        };

        let registration = self.gate.register(req).await;
        if registration.started {
            self.start(registration.handle, ctx);
        }

        Ok(BulkSubmission {
            registration,
            total_items,
        })
    }

    async fn keys_for(&self, ctx: &BulkContext) -> anyhow::Result<Vec<TargetKey>> {
        match ctx.kind {
            BulkKind::Scoring => {
                let groups = self.deals.active_groups().await?;
                Ok(ctx
                    .deal_ids
                    .iter()
                    .flat_map(|d| groups.iter().map(move |g| TargetKey::scoped(*d, g.id)))
                    .collect())
            }
            BulkKind::Enrichment => Ok(ctx.deal_ids.iter().copied().map(TargetKey::entity).collect()),
        }
    }

    fn start(self: &Arc<Self>, handle: Option<OperationHandle>, ctx: BulkContext) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let status = this.drive(handle, &ctx).await;
            if let Some(h) = handle {
                if let Err(e) = this.gate.complete_operation(&h, status).await {
                    tracing::warn!(operation_id = %h.id, error = %e, "failed to record bulk completion");
                }
            }
        })
    }

    /// Enqueue, then follow the items until none are outstanding or the
    /// poll budget runs out.
    async fn drive(&self, handle: Option<OperationHandle>, ctx: &BulkContext) -> OperationStatus {
        let queue = ctx.kind.queue();
        let keys = match self.keys_for(ctx).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(queue, error = %e, "could not build bulk keys");
                return OperationStatus::Failed;
            }
        };

        let report = match self.queue.enqueue(queue, &keys, EnqueuePolicy::Requeue).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(queue, committed = e.committed(), error = %e, "bulk enqueue failed");
                return OperationStatus::Failed;
            }
        };
        tracing::info!(queue, submitted = report.submitted, enqueued = report.enqueued, "bulk enqueue done");

        // The worker may already have synced some rows while answering the kick.
        if let (Some(h), Some(synced)) = (handle, report.trigger.and_then(|t| t.synced)) {
            self.record_progress(&h, synced as i64).await;
        }

        let counts = self.follow(handle, queue, &keys).await;
        if counts.outstanding() > 0 {
            tracing::warn!(
                queue,
                outstanding = counts.outstanding(),
                "bulk tracking budget exhausted; releasing admission slot"
            );
        }
        if counts.completed == 0 && counts.failed > 0 {
            OperationStatus::Failed
        } else {
            OperationStatus::Completed
        }
    }

    async fn follow(
        &self,
        handle: Option<OperationHandle>,
        queue: &str,
        keys: &[TargetKey],
    ) -> StatusCounts {
        let period = self.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last = StatusCounts::default();
        for _ in 0..self.max_polls {
            ticker.tick().await;
            match self.queue.store().count_by_status(queue, keys).await {
                Ok(counts) => last = counts,
                Err(e) => {
                    tracing::warn!(queue, error = %e, "bulk progress read failed");
                    continue;
                }
            }
            if let Some(h) = handle {
                self.record_progress(&h, last.finished()).await;
            }
            if last.outstanding() == 0 {
                break;
            }
        }
        last
    }

    async fn record_progress(&self, handle: &OperationHandle, completed: i64) {
        let completed = i32::try_from(completed).unwrap_or(i32::MAX);
        if let Err(e) = self.gate.update_progress(handle, completed).await {
            tracing::warn!(operation_id = %handle.id, error = %e, "progress update failed");
        }
    }
}
