mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::wait_until;
use scoreflow::gate::{run_reaper, AdmissionGate, AutoStartRegistry};
use scoreflow::ledger::{
    LedgerStore, MajorOperation, MajorOperationRequest, MemoryLedgerStore, OperationStatus,
    BULK_ENRICH, BULK_SCORE,
};
use serde_json::json;

fn req(kind: &str, tag: &str) -> MajorOperationRequest {
    MajorOperationRequest {
        operation_type: kind.to_string(),
        total_items: 10,
        description: format!("test {tag}"),
        owner: "ops@example.com".into(),
        context: json!({ "tag": tag }),
    }
}

fn gate() -> (AdmissionGate, Arc<MemoryLedgerStore>) {
    let ledger = Arc::new(MemoryLedgerStore::new());
    let gate = AdmissionGate::new(ledger.clone(), Arc::new(AutoStartRegistry::new()));
    (gate, ledger)
}

/// Registers a callback for `kind` that records the promoted operations.
fn record_starts(gate: &AdmissionGate, kind: &str) -> Arc<Mutex<Vec<MajorOperation>>> {
    let started = Arc::new(Mutex::new(Vec::new()));
    let sink = started.clone();
    gate.autostart().register(kind, move |op| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.lock().unwrap().push(op);
            Ok::<(), anyhow::Error>(())
        })
    });
    started
}

async fn running_count(ledger: &MemoryLedgerStore) -> usize {
    ledger
        .snapshot()
        .await
        .iter()
        .filter(|o| o.status == OperationStatus::Running)
        .count()
}

#[tokio::test]
async fn second_registration_is_queued_behind_the_first() {
    let (gate, ledger) = gate();

    let first = gate.register(req(BULK_SCORE, "a")).await;
    let second = gate.register(req(BULK_ENRICH, "b")).await;

    assert!(first.started);
    assert!(!second.started);
    assert!(second.handle.is_some());
    assert_eq!(running_count(&ledger).await, 1);

    let queued = ledger.get(second.handle.unwrap().id).await.unwrap().unwrap();
    assert_eq!(queued.status, OperationStatus::Queued);
}

#[tokio::test]
async fn concurrent_registrations_admit_exactly_one() {
    let (gate, ledger) = gate();

    let (a, b, c) = tokio::join!(
        gate.register(req(BULK_SCORE, "a")),
        gate.register(req(BULK_SCORE, "b")),
        gate.register(req(BULK_SCORE, "c")),
    );

    let started = [a, b, c].iter().filter(|r| r.started).count();
    assert_eq!(started, 1);
    assert_eq!(running_count(&ledger).await, 1);
}

#[tokio::test]
async fn completing_the_active_operation_auto_starts_the_oldest_queued() {
    let (gate, ledger) = gate();
    let started = record_starts(&gate, BULK_SCORE);

    let first = gate.register(req(BULK_SCORE, "a")).await;
    let second = gate.register(req(BULK_SCORE, "b")).await;
    let third = gate.register(req(BULK_SCORE, "c")).await;

    let moved = gate
        .complete_operation(&first.handle.unwrap(), OperationStatus::Completed)
        .await
        .unwrap();
    assert!(moved);

    {
        let started = started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].id, second.handle.unwrap().id);
        assert_eq!(started[0].context, json!({ "tag": "b" }));
    }

    let third_row = ledger.get(third.handle.unwrap().id).await.unwrap().unwrap();
    assert_eq!(third_row.status, OperationStatus::Queued);
    assert_eq!(running_count(&ledger).await, 1);
}

#[tokio::test]
async fn complete_is_idempotent() {
    let (gate, ledger) = gate();
    let started = record_starts(&gate, BULK_SCORE);

    let first = gate.register(req(BULK_SCORE, "a")).await;
    gate.register(req(BULK_SCORE, "b")).await;
    let h = first.handle.unwrap();

    assert!(gate
        .complete_operation(&h, OperationStatus::Completed)
        .await
        .unwrap());
    assert!(!gate.complete_operation(&h, OperationStatus::Failed).await.unwrap());

    let row = ledger.get(h.id).await.unwrap().unwrap();
    assert_eq!(row.status, OperationStatus::Completed);
    assert_eq!(started.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn operation_without_callback_is_failed_and_skipped() {
    let (gate, ledger) = gate();
    let started = record_starts(&gate, BULK_SCORE);

    let first = gate.register(req(BULK_SCORE, "a")).await;
    let orphan = gate.register(req(BULK_ENRICH, "no-callback")).await;
    let next = gate.register(req(BULK_SCORE, "c")).await;

    gate.complete_operation(&first.handle.unwrap(), OperationStatus::Completed)
        .await
        .unwrap();

    let orphan_row = ledger.get(orphan.handle.unwrap().id).await.unwrap().unwrap();
    assert_eq!(orphan_row.status, OperationStatus::Failed);

    let next_row = ledger.get(next.handle.unwrap().id).await.unwrap().unwrap();
    assert_eq!(next_row.status, OperationStatus::Running);
    assert_eq!(started.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn progress_never_decreases() {
    let (gate, ledger) = gate();
    let h = gate.register(req(BULK_SCORE, "a")).await.handle.unwrap();

    assert!(gate.update_progress(&h, 5).await.unwrap());
    assert!(!gate.update_progress(&h, 3).await.unwrap());
    assert!(gate.update_progress(&h, 7).await.unwrap());
    assert!(!gate.update_progress(&h, 7).await.unwrap());

    let row = ledger.get(h.id).await.unwrap().unwrap();
    assert_eq!(row.completed_items, 7);
    assert_eq!(row.percent(), 70);
}

#[tokio::test]
async fn ledger_outage_lets_the_caller_proceed_untracked() {
    let (gate, ledger) = gate();
    ledger.fail_writes(true).await;

    let reg = gate.register(req(BULK_SCORE, "a")).await;
    assert!(reg.started);
    assert!(reg.handle.is_none());

    ledger.fail_writes(false).await;
    assert!(ledger.snapshot().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reaper_promotes_after_out_of_band_completion() {
    let (gate, ledger) = gate();
    let started = record_starts(&gate, BULK_SCORE);

    let first = gate.register(req(BULK_SCORE, "a")).await;
    let second = gate.register(req(BULK_SCORE, "b")).await;

    // finished directly in the ledger, e.g. by an operator
    ledger
        .finish(first.handle.unwrap().id, OperationStatus::Failed)
        .await
        .unwrap();

    let reaper = tokio::spawn(run_reaper(Arc::new(gate.clone()), Duration::from_secs(5)));

    let id = second.handle.unwrap().id;
    let l = ledger.clone();
    wait_until(move || {
        let l = l.clone();
        async move {
            l.get(id).await.unwrap().unwrap().status == OperationStatus::Running
        }
    })
    .await;
    assert_eq!(started.lock().unwrap().len(), 1);

    reaper.abort();
}

#[tokio::test(start_paused = true)]
async fn failed_auto_start_is_released_even_when_the_ledger_stumbles() {
    let (gate, ledger) = gate();
    let started = record_starts(&gate, BULK_SCORE);

    let first = gate.register(req(BULK_SCORE, "a")).await;
    let orphan = gate.register(req(BULK_ENRICH, "no-callback")).await;
    let next = gate.register(req(BULK_SCORE, "c")).await;

    ledger
        .finish(first.handle.unwrap().id, OperationStatus::Completed)
        .await
        .unwrap();
    ledger.fail_finishes(2).await;

    let promoted = gate.promote_next().await.unwrap();
    assert_eq!(promoted.map(|o| o.id), Some(next.handle.unwrap().id));

    let orphan_row = ledger.get(orphan.handle.unwrap().id).await.unwrap().unwrap();
    assert_eq!(orphan_row.status, OperationStatus::Failed);
    assert_eq!(running_count(&ledger).await, 1);
    assert_eq!(started.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn promotion_reports_no_error_when_releasing_keeps_failing() {
    let (gate, ledger) = gate();

    let first = gate.register(req(BULK_SCORE, "a")).await;
    let orphan = gate.register(req(BULK_ENRICH, "no-callback")).await;
    ledger
        .finish(first.handle.unwrap().id, OperationStatus::Completed)
        .await
        .unwrap();
    ledger.fail_finishes(10).await;

    assert!(gate.promote_next().await.unwrap().is_none());
    let row = ledger.get(orphan.handle.unwrap().id).await.unwrap().unwrap();
    assert_eq!(row.status, OperationStatus::Running);
}
