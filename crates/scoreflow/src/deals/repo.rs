use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::deals::model::{Deal, NewCandidate, ProcessingGroup};
use crate::deals::store::DealStore;

#[derive(Clone)]
pub struct DealsRepo {
    pool: PgPool,
}

impl DealsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DealStore for DealsRepo {
    async fn load_deal(&self, deal_id: Uuid) -> anyhow::Result<Option<Deal>> {
        let deal = sqlx::query_as::<_, Deal>(
            r#"
            SELECT id, title, industry, geography, revenue_usd, ebitda_usd,
                   website, search_qualifiers
            FROM deals
            WHERE id = $1
            "#,
        )
        .bind(deal_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(deal)
    }

    async fn active_groups(&self) -> anyhow::Result<Vec<ProcessingGroup>> {
        let groups = sqlx::query_as::<_, ProcessingGroup>(
            r#"
            SELECT id, name, active
            FROM processing_groups
            WHERE active = true
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(groups)
    }

    async fn linked_groups(&self, deal_id: Uuid) -> anyhow::Result<HashSet<Uuid>> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT group_id FROM group_deals WHERE deal_id = $1")
                .bind(deal_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(ids.into_iter().collect())
    }

    async fn link_groups(&self, deal_id: Uuid, group_ids: &[Uuid]) -> anyhow::Result<u64> {
        if group_ids.is_empty() {
            return Ok(0);
        }

        let res = sqlx::query(
            r#"
            INSERT INTO group_deals (group_id, deal_id)
            SELECT g, $1
            FROM unnest($2::uuid[]) AS g
            ON CONFLICT (group_id, deal_id) DO NOTHING
            "#,
        )
        .bind(deal_id)
        .bind(group_ids)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn has_result(&self, deal_id: Uuid) -> anyhow::Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM deal_scores WHERE deal_id = $1)")
                .bind(deal_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }

    async fn known_candidates(&self, keys: &[String]) -> anyhow::Result<HashSet<String>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }

        let found: Vec<String> = sqlx::query_scalar(
            "SELECT identity_key FROM candidates WHERE identity_key = ANY($1::text[])",
        )
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;

        Ok(found.into_iter().collect())
    }

    async fn insert_candidates(&self, candidates: &[NewCandidate]) -> anyhow::Result<u64> {
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut keys = Vec::with_capacity(candidates.len());
        let mut names = Vec::with_capacity(candidates.len());
        let mut websites: Vec<Option<String>> = Vec::with_capacity(candidates.len());
        let mut sources = Vec::with_capacity(candidates.len());
        let mut origins = Vec::with_capacity(candidates.len());
        let mut discovered: Vec<DateTime<Utc>> = Vec::with_capacity(candidates.len());
        let mut queries = Vec::with_capacity(candidates.len());
        for c in candidates {
            keys.push(c.identity_key.clone());
            names.push(c.name.clone());
            websites.push(c.website.clone());
            sources.push(c.provenance.source.clone());
            origins.push(c.provenance.origin_deal_id);
            discovered.push(c.provenance.discovered_at);
            queries.push(c.provenance.query.clone());
        }

        let res = sqlx::query(
            r#"
            INSERT INTO candidates (
              identity_key, name, website, source, origin_deal_id, discovered_at, query
            )
            SELECT *
            FROM unnest(
              $1::text[], $2::text[], $3::text[], $4::text[],
              $5::uuid[], $6::timestamptz[], $7::text[]
            )
            ON CONFLICT (identity_key) DO NOTHING
            "#,
        )
        .bind(&keys)
        .bind(&names)
        .bind(&websites)
        .bind(&sources)
        .bind(&origins)
        .bind(&discovered)
        .bind(&queries)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}
