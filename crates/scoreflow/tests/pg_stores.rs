// tests/pg_stores.rs
mod common;

use chrono::Utc;
use scoreflow::deals::{DealStore, DealsRepo, NewCandidate, Provenance};
use scoreflow::ledger::{
    LedgerRepo, LedgerStore, MajorOperationRequest, OperationStatus, BULK_SCORE,
};
use scoreflow::queue::{EnqueuePolicy, QueueRepo, QueueStatus, QueueStore, TargetKey, SCORING_QUEUE};
use serde_json::json;
use serial_test::serial;
use uuid::Uuid;

fn req(tag: &str) -> MajorOperationRequest {
    MajorOperationRequest {
        operation_type: BULK_SCORE.to_string(),
        total_items: 4,
        description: format!("pg {tag}"),
        owner: "ops".into(),
        context: json!({ "tag": tag }),
    }
}

#[tokio::test]
#[serial]
async fn queue_upsert_is_idempotent_per_key() -> anyhow::Result<()> {
    let Some(pool) = common::setup_db().await else {
        return Ok(());
    };
    let repo = QueueRepo::new(pool);
    let key = TargetKey::scoped(Uuid::new_v4(), Uuid::new_v4());

    assert_eq!(repo.upsert(SCORING_QUEUE, &[key], EnqueuePolicy::Requeue).await?, 1);
    let claimed = repo.claim_batch(SCORING_QUEUE, 10).await?;
    assert_eq!(claimed.len(), 1);
    repo.mark_failed(claimed[0].id, "boom").await?;

    // failed rows are reset in place
    assert_eq!(repo.upsert(SCORING_QUEUE, &[key], EnqueuePolicy::FillGaps).await?, 1);
    let item = repo.get(SCORING_QUEUE, &key).await?.expect("row");
    assert_eq!(item.id, claimed[0].id);
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.last_error, None);

    // pending rows are left alone by FillGaps
    assert_eq!(repo.upsert(SCORING_QUEUE, &[key], EnqueuePolicy::FillGaps).await?, 0);
    assert_eq!(repo.count_outstanding(SCORING_QUEUE, key.entity_id).await?, 1);
    assert_eq!(repo.list_for_entity(SCORING_QUEUE, key.entity_id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn ledger_keeps_a_single_running_slot() -> anyhow::Result<()> {
    let Some(pool) = common::setup_db().await else {
        return Ok(());
    };
    let repo = LedgerRepo::new(pool);

    let first = repo.insert_running_if_idle(&req("a")).await?.expect("slot free");
    assert!(repo.insert_running_if_idle(&req("b")).await?.is_none());
    let queued = repo.insert_queued(&req("b")).await?;
    assert_eq!(queued.status, OperationStatus::Queued);

    // nothing to promote while the slot is taken
    assert!(repo.promote_oldest_queued().await?.is_none());

    assert!(repo.raise_progress(first.id, 3).await?);
    assert!(!repo.raise_progress(first.id, 2).await?);

    assert!(repo.finish(first.id, OperationStatus::Completed).await?);
    assert!(!repo.finish(first.id, OperationStatus::Failed).await?);

    let promoted = repo.promote_oldest_queued().await?.expect("queued row");
    assert_eq!(promoted.id, queued.id);
    assert_eq!(promoted.status, OperationStatus::Running);
    assert_eq!(repo.running().await?.map(|o| o.id), Some(queued.id));

    let done = repo.get(first.id).await?.expect("row");
    assert_eq!(done.completed_items, 3);
    assert!(done.finished_at.is_some());

    let listed = repo.list(Some(OperationStatus::Completed), 10).await?;
    assert_eq!(listed.len(), 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn deal_links_and_candidates_skip_duplicates() -> anyhow::Result<()> {
    let Some(pool) = common::setup_db().await else {
        return Ok(());
    };
    let deal_id = Uuid::new_v4();
    let group_id = Uuid::new_v4();
    sqlx::query("INSERT INTO deals (id, title, industry) VALUES ($1, 'Falcon', 'HVAC')")
        .bind(deal_id)
        .execute(&pool)
        .await?;
    sqlx::query("INSERT INTO processing_groups (id, name) VALUES ($1, 'north')")
        .bind(group_id)
        .execute(&pool)
        .await?;

    let repo = DealsRepo::new(pool.clone());
    let deal = repo.load_deal(deal_id).await?.expect("deal");
    assert_eq!(deal.industry.as_deref(), Some("HVAC"));
    assert_eq!(repo.active_groups().await?.len(), 1);

    assert_eq!(repo.link_groups(deal_id, &[group_id]).await?, 1);
    assert_eq!(repo.link_groups(deal_id, &[group_id]).await?, 0);
    assert!(repo.linked_groups(deal_id).await?.contains(&group_id));

    assert!(!repo.has_result(deal_id).await?);
    sqlx::query("INSERT INTO deal_scores (deal_id, group_id, score) VALUES ($1, $2, 0.7)")
        .bind(deal_id)
        .bind(group_id)
        .execute(&pool)
        .await?;
    assert!(repo.has_result(deal_id).await?);

    let cand = NewCandidate {
        identity_key: "acme.com".into(),
        name: "Acme".into(),
        website: Some("https://acme.com".into()),
        provenance: Provenance {
            source: "static".into(),
            origin_deal_id: deal_id,
            discovered_at: Utc::now(),
            query: "HVAC companies acquirers".into(),
        },
    };
    assert_eq!(repo.insert_candidates(&[cand.clone()]).await?, 1);
    assert_eq!(repo.insert_candidates(&[cand]).await?, 0);

    let known = repo
        .known_candidates(&["acme.com".to_string(), "other.com".to_string()])
        .await?;
    assert_eq!(known.len(), 1);
    assert!(known.contains("acme.com"));
    Ok(())
}
