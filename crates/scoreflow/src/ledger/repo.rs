use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::is_unique_violation;
use crate::ledger::model::{MajorOperation, MajorOperationRequest, OperationStatus};
use crate::ledger::store::LedgerStore;

#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    id: Uuid,
    operation_type: String,
    total_items: i32,
    completed_items: i32,
    status: String,
    description: String,
    owner: String,
    context: Value,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<OperationRow> for MajorOperation {
    type Error = anyhow::Error;

    fn try_from(row: OperationRow) -> anyhow::Result<Self> {
        let status = OperationStatus::parse(&row.status)
            .ok_or_else(|| anyhow::anyhow!("unknown operation status {:?}", row.status))?;
        Ok(MajorOperation {
            id: row.id,
            operation_type: row.operation_type,
            total_items: row.total_items,
            completed_items: row.completed_items,
            status,
            description: row.description,
            owner: row.owner,
            context: row.context,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Clone)]
pub struct LedgerRepo {
    pool: PgPool,
}

impl LedgerRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_with_status(
        &self,
        req: &MajorOperationRequest,
        status: OperationStatus,
    ) -> Result<Option<OperationRow>, sqlx::Error> {
        // The partial unique index on running rows turns the `running` insert
        // into a compare-and-swap on the active slot.
        sqlx::query_as::<_, OperationRow>(
            r#"
            INSERT INTO major_operations (
              id, operation_type, total_items, completed_items, status,
              description, owner, context, started_at
            )
            VALUES (
              $1, $2, $3, 0, $4,
              $5, $6, $7, CASE WHEN $4 = 'running' THEN now() ELSE NULL END
            )
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&req.operation_type)
        .bind(req.total_items.max(0))
        .bind(status.as_str())
        .bind(&req.description)
        .bind(&req.owner)
        .bind(&req.context)
        .fetch_optional(&self.pool)
        .await
    }
}

#[async_trait]
impl LedgerStore for LedgerRepo {
    async fn insert_running_if_idle(
        &self,
        req: &MajorOperationRequest,
    ) -> anyhow::Result<Option<MajorOperation>> {
        let row = self
            .insert_with_status(req, OperationStatus::Running)
            .await?;
        row.map(MajorOperation::try_from).transpose()
    }

    async fn insert_queued(&self, req: &MajorOperationRequest) -> anyhow::Result<MajorOperation> {
        let row = self
            .insert_with_status(req, OperationStatus::Queued)
            .await?
            .ok_or_else(|| anyhow::anyhow!("queued insert returned no row"))?;
        MajorOperation::try_from(row)
    }

    async fn promote_oldest_queued(&self) -> anyhow::Result<Option<MajorOperation>> {
        let res = sqlx::query_as::<_, OperationRow>(
            r#"
            WITH candidate AS (
              SELECT id
              FROM major_operations
              WHERE status = 'queued'
              ORDER BY created_at ASC, id ASC
              FOR UPDATE SKIP LOCKED
              LIMIT 1
            )
            UPDATE major_operations m
            SET status = 'running',
                started_at = now(),
                updated_at = now()
            FROM candidate
            WHERE m.id = candidate.id
              AND NOT EXISTS (
                SELECT 1 FROM major_operations r WHERE r.status = 'running'
              )
            RETURNING m.*
            "#,
        )
        .fetch_optional(&self.pool)
        .await;

        match res {
            Ok(row) => row.map(MajorOperation::try_from).transpose(),
            // Another caller filled the slot between our check and write.
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn raise_progress(&self, id: Uuid, completed_items: i32) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE major_operations
            SET completed_items = $2,
                updated_at = now()
            WHERE id = $1
              AND completed_items < $2
            "#,
        )
        .bind(id)
        .bind(completed_items)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn finish(&self, id: Uuid, status: OperationStatus) -> anyhow::Result<bool> {
        if !status.is_terminal() {
            anyhow::bail!("finish requires a terminal status, got {}", status.as_str());
        }

        let res = sqlx::query(
            r#"
            UPDATE major_operations
            SET status = $2,
                finished_at = now(),
                updated_at = now()
            WHERE id = $1
              AND status IN ('queued', 'running')
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<MajorOperation>> {
        let row = sqlx::query_as::<_, OperationRow>("SELECT * FROM major_operations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(MajorOperation::try_from).transpose()
    }

    async fn running(&self) -> anyhow::Result<Option<MajorOperation>> {
        let row = sqlx::query_as::<_, OperationRow>(
            "SELECT * FROM major_operations WHERE status = 'running' LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(MajorOperation::try_from).transpose()
    }

    async fn list(
        &self,
        status: Option<OperationStatus>,
        limit: i64,
    ) -> anyhow::Result<Vec<MajorOperation>> {
        let limit = limit.clamp(1, 500);

        let rows = match status {
            Some(st) => {
                sqlx::query_as::<_, OperationRow>(
                    r#"
                    SELECT *
                    FROM major_operations
                    WHERE status = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#,
                )
                .bind(st.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, OperationRow>(
                    r#"
                    SELECT *
                    FROM major_operations
                    ORDER BY created_at DESC, id DESC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(MajorOperation::try_from).collect()
    }
}
