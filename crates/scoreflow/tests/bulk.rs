mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, CountingTrigger};
use scoreflow::bulk::{BulkContext, BulkKind, BulkOperations};
use scoreflow::deals::MemoryDealStore;
use scoreflow::gate::{AdmissionGate, AutoStartRegistry};
use scoreflow::ledger::{LedgerStore, MemoryLedgerStore, OperationStatus};
use scoreflow::queue::{
    MemoryQueueStore, QueueStatus, TriggerSummary, WorkQueue, ENRICHMENT_QUEUE, SCORING_QUEUE,
};
use uuid::Uuid;

struct Fixture {
    bulk: Arc<BulkOperations>,
    ledger: Arc<MemoryLedgerStore>,
    queue_store: Arc<MemoryQueueStore>,
    deals: Arc<MemoryDealStore>,
}

fn fixture(trigger: CountingTrigger) -> Fixture {
    let ledger = Arc::new(MemoryLedgerStore::new());
    let queue_store = Arc::new(MemoryQueueStore::new());
    let deals = Arc::new(MemoryDealStore::new());
    let gate = AdmissionGate::new(ledger.clone(), Arc::new(AutoStartRegistry::new()));
    let queue = WorkQueue::new(queue_store.clone(), Arc::new(trigger));

    let bulk = BulkOperations::new(gate, queue, deals.clone(), Duration::from_secs(1), 30);
    bulk.register_autostart();

    Fixture {
        bulk,
        ledger,
        queue_store,
        deals,
    }
}

async fn finish_all(store: &MemoryQueueStore, queue: &str) {
    for item in store.items().await {
        if item.queue == queue {
            store
                .set_status(queue, &item.target, QueueStatus::Completed)
                .await;
        }
    }
}

async fn op_status(ledger: &MemoryLedgerStore, id: Uuid) -> OperationStatus {
    ledger.get(id).await.unwrap().unwrap().status
}

#[tokio::test(start_paused = true)]
async fn scoring_covers_every_deal_and_group_and_completes() {
    let f = fixture(CountingTrigger::default());
    f.deals.add_group("north").await;
    f.deals.add_group("south").await;
    let deals = vec![Uuid::new_v4(), Uuid::new_v4()];

    let sub = f.bulk.submit_scoring(deals.clone(), "ops").await.unwrap();
    assert!(sub.registration.started);
    assert_eq!(sub.total_items, 4);
    let id = sub.registration.handle.unwrap().id;

    let store = f.queue_store.clone();
    wait_until(move || {
        let store = store.clone();
        async move { store.len().await == 4 }
    })
    .await;
    assert!(f
        .queue_store
        .items()
        .await
        .iter()
        .all(|i| i.queue == SCORING_QUEUE && i.target.scope_id.is_some()));

    finish_all(&f.queue_store, SCORING_QUEUE).await;

    let ledger = f.ledger.clone();
    wait_until(move || {
        let ledger = ledger.clone();
        async move { op_status(&ledger, id).await == OperationStatus::Completed }
    })
    .await;

    let op = f.ledger.get(id).await.unwrap().unwrap();
    assert_eq!(op.completed_items, 4);
    assert_eq!(op.percent(), 100);
    let ctx: BulkContext = serde_json::from_value(op.context).unwrap();
    assert_eq!(ctx.kind, BulkKind::Scoring);
    assert_eq!(ctx.deal_ids.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn queued_bulk_job_runs_when_the_active_one_finishes() {
    let f = fixture(CountingTrigger::default());
    f.deals.add_group("north").await;

    let first = f
        .bulk
        .submit_scoring(vec![Uuid::new_v4()], "ops")
        .await
        .unwrap();
    let enrich_deal = Uuid::new_v4();
    let second = f
        .bulk
        .submit_enrichment(vec![enrich_deal], "ops")
        .await
        .unwrap();

    assert!(first.registration.started);
    assert!(!second.registration.started);
    let second_id = second.registration.handle.unwrap().id;

    // the deferred job must not touch the queue yet
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(f
        .queue_store
        .items()
        .await
        .iter()
        .all(|i| i.queue != ENRICHMENT_QUEUE));

    finish_all(&f.queue_store, SCORING_QUEUE).await;

    let store = f.queue_store.clone();
    wait_until(move || {
        let store = store.clone();
        async move {
            store
                .items()
                .await
                .iter()
                .any(|i| i.queue == ENRICHMENT_QUEUE && i.target.entity_id == enrich_deal)
        }
    })
    .await;
    assert_eq!(op_status(&f.ledger, second_id).await, OperationStatus::Running);

    finish_all(&f.queue_store, ENRICHMENT_QUEUE).await;
    let ledger = f.ledger.clone();
    wait_until(move || {
        let ledger = ledger.clone();
        async move { op_status(&ledger, second_id).await == OperationStatus::Completed }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn trigger_summary_advances_progress_right_away() {
    let f = fixture(CountingTrigger::with_summary(TriggerSummary {
        processed: Some(3),
        synced: Some(2),
    }));
    let sub = f
        .bulk
        .submit_enrichment(vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()], "ops")
        .await
        .unwrap();
    let id = sub.registration.handle.unwrap().id;

    let ledger = f.ledger.clone();
    wait_until(move || {
        let ledger = ledger.clone();
        async move { ledger.get(id).await.unwrap().unwrap().completed_items == 2 }
    })
    .await;
    assert_eq!(op_status(&f.ledger, id).await, OperationStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn all_items_failing_fails_the_operation() {
    let f = fixture(CountingTrigger::default());
    let sub = f
        .bulk
        .submit_enrichment(vec![Uuid::new_v4()], "ops")
        .await
        .unwrap();
    let id = sub.registration.handle.unwrap().id;

    let store = f.queue_store.clone();
    wait_until(move || {
        let store = store.clone();
        async move { store.len().await == 1 }
    })
    .await;
    for item in f.queue_store.items().await {
        f.queue_store
            .set_status(&item.queue, &item.target, QueueStatus::Failed)
            .await;
    }

    let ledger = f.ledger.clone();
    wait_until(move || {
        let ledger = ledger.clone();
        async move { op_status(&ledger, id).await == OperationStatus::Failed }
    })
    .await;
}

#[tokio::test]
async fn empty_selection_is_rejected() {
    let f = fixture(CountingTrigger::default());
    assert!(f.bulk.submit_enrichment(Vec::new(), "ops").await.is_err());
    assert!(f.ledger.snapshot().await.is_empty());
}

#[tokio::test]
async fn scoring_without_groups_is_rejected() {
    let f = fixture(CountingTrigger::default());
    assert!(f
        .bulk
        .submit_scoring(vec![Uuid::new_v4()], "ops")
        .await
        .is_err());
    assert!(f.ledger.snapshot().await.is_empty());
}
