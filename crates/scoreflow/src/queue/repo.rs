// crates/scoreflow/src/queue/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::queue::model::{EnqueuePolicy, QueueItem, QueueStatus, StatusCounts, TargetKey};
use crate::queue::store::QueueStore;

const ITEM_COLUMNS: &str = r#"
    id, queue, entity_id, scope_id, status, attempts,
    queued_at, started_at, completed_at, last_error
"#;

#[derive(Debug, sqlx::FromRow)]
struct QueueItemRow {
    id: Uuid,
    queue: String,
    entity_id: Uuid,
    scope_id: Option<Uuid>,
    status: String,
    attempts: i32,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TryFrom<QueueItemRow> for QueueItem {
    type Error = anyhow::Error;

    fn try_from(row: QueueItemRow) -> anyhow::Result<Self> {
        let status = QueueStatus::parse(&row.status)
            .ok_or_else(|| anyhow::anyhow!("unknown queue status {:?}", row.status))?;
        Ok(QueueItem {
            id: row.id,
            queue: row.queue,
            target: TargetKey {
                entity_id: row.entity_id,
                scope_id: row.scope_id,
            },
            status,
            attempts: row.attempts,
            queued_at: row.queued_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_error: row.last_error,
        })
    }
}

fn into_items(rows: Vec<QueueItemRow>) -> anyhow::Result<Vec<QueueItem>> {
    rows.into_iter().map(QueueItem::try_from).collect()
}

#[derive(Clone)]
pub struct QueueRepo {
    pool: PgPool,
}

impl QueueRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueStore for QueueRepo {
    async fn upsert(
        &self,
        queue: &str,
        keys: &[TargetKey],
        policy: EnqueuePolicy,
    ) -> anyhow::Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let target_keys: Vec<String> = keys.iter().map(TargetKey::as_key).collect();
        let entity_ids: Vec<Uuid> = keys.iter().map(|k| k.entity_id).collect();
        let scope_ids: Vec<Option<Uuid>> = keys.iter().map(|k| k.scope_id).collect();

        // Only the conflict guard differs between the policies.
        let guard = match policy {
            EnqueuePolicy::Requeue => "queue_items.status <> 'processing'",
            EnqueuePolicy::FillGaps => "queue_items.status = 'failed'",
        };

        let sql = format!(
            r#"
            INSERT INTO queue_items (queue, target_key, entity_id, scope_id, status, attempts, queued_at)
            SELECT $1, t.target_key, t.entity_id, t.scope_id, 'pending', 0, now()
            FROM unnest($2::text[], $3::uuid[], $4::uuid[]) AS t(target_key, entity_id, scope_id)
            ON CONFLICT (queue, target_key) DO UPDATE
            SET status = 'pending',
                attempts = 0,
                queued_at = now(),
                started_at = NULL,
                completed_at = NULL,
                last_error = NULL,
                updated_at = now()
            WHERE {guard}
            "#
        );

        let res = sqlx::query(&sql)
            .bind(queue)
            .bind(&target_keys)
            .bind(&entity_ids)
            .bind(&scope_ids)
            .execute(&self.pool)
            .await?;

        Ok(res.rows_affected())
    }

    async fn get(&self, queue: &str, key: &TargetKey) -> anyhow::Result<Option<QueueItem>> {
        let row = sqlx::query_as::<_, QueueItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE queue = $1 AND target_key = $2"
        ))
        .bind(queue)
        .bind(key.as_key())
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueItem::try_from).transpose()
    }

    async fn list_for_entity(&self, queue: &str, entity_id: Uuid) -> anyhow::Result<Vec<QueueItem>> {
        let rows = sqlx::query_as::<_, QueueItemRow>(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM queue_items
            WHERE queue = $1 AND entity_id = $2
            ORDER BY queued_at ASC, id ASC
            "#
        ))
        .bind(queue)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        into_items(rows)
    }

    async fn count_outstanding(&self, queue: &str, entity_id: Uuid) -> anyhow::Result<i64> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM queue_items
            WHERE queue = $1
              AND entity_id = $2
              AND status IN ('pending', 'processing')
            "#,
        )
        .bind(queue)
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(n)
    }

    async fn count_by_status(&self, queue: &str, keys: &[TargetKey]) -> anyhow::Result<StatusCounts> {
        if keys.is_empty() {
            return Ok(StatusCounts::default());
        }
        let target_keys: Vec<String> = keys.iter().map(TargetKey::as_key).collect();

        let (pending, processing, completed, failed) =
            sqlx::query_as::<_, (i64, i64, i64, i64)>(
                r#"
                SELECT
                  COUNT(*) FILTER (WHERE status = 'pending')    AS pending,
                  COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                  COUNT(*) FILTER (WHERE status = 'completed')  AS completed,
                  COUNT(*) FILTER (WHERE status = 'failed')     AS failed
                FROM queue_items
                WHERE queue = $1 AND target_key = ANY($2)
                "#,
            )
            .bind(queue)
            .bind(&target_keys)
            .fetch_one(&self.pool)
            .await?;

        Ok(StatusCounts {
            pending,
            processing,
            completed,
            failed,
        })
    }

    async fn claim_batch(&self, queue: &str, limit: i64) -> anyhow::Result<Vec<QueueItem>> {
        let limit = limit.clamp(1, 500);
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, QueueItemRow>(
            r#"
            WITH candidate AS (
              SELECT id
              FROM queue_items
              WHERE queue = $1
                AND status = 'pending'
              ORDER BY queued_at ASC, id ASC
              FOR UPDATE SKIP LOCKED
              LIMIT $2
            )
            UPDATE queue_items q
            SET status = 'processing',
                attempts = q.attempts + 1,
                started_at = now(),
                updated_at = now()
            FROM candidate
            WHERE q.id = candidate.id
            RETURNING
              q.id, q.queue, q.entity_id, q.scope_id, q.status, q.attempts,
              q.queued_at, q.started_at, q.completed_at, q.last_error
            "#
        )
        .bind(queue)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        into_items(rows)
    }

    async fn mark_completed(&self, item_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'completed',
                completed_at = now(),
                last_error = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'processing'
            "#,
        )
        .bind(item_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_failed(&self, item_id: Uuid, error: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'failed',
                completed_at = now(),
                last_error = $2,
                updated_at = now()
            WHERE id = $1
              AND status = 'processing'
            "#,
        )
        .bind(item_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
