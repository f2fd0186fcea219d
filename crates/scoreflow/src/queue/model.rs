use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub const SCORING_QUEUE: &str = "scoring";
pub const ENRICHMENT_QUEUE: &str = "enrichment";

/// Identifies the entity a unit of work targets, optionally narrowed to a
/// processing group. Two keys with the same fields address the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TargetKey {
    pub entity_id: Uuid,
    pub scope_id: Option<Uuid>,
}

impl TargetKey {
    pub fn entity(entity_id: Uuid) -> Self {
        Self {
            entity_id,
            scope_id: None,
        }
    }

    pub fn scoped(entity_id: Uuid, scope_id: Uuid) -> Self {
        Self {
            entity_id,
            scope_id: Some(scope_id),
        }
    }

    /// Conflict-target string stored in `queue_items.target_key`:
    /// `entity` or `entity:scope`.
    pub fn as_key(&self) -> String {
        match self.scope_id {
            Some(scope) => format!("{}:{scope}", self.entity_id),
            None => self.entity_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }

    pub fn is_outstanding(&self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Processing)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub queue: String,
    pub target: TargetKey,
    pub status: QueueStatus,
    pub attempts: i32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// What an upsert does when a row for the key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueuePolicy {
    /// Reset the row to pending with zero attempts. Rows a worker is
    /// currently processing are left alone.
    Requeue,
    /// Insert missing rows and retry failed ones; pending, processing and
    /// completed rows are left alone.
    FillGaps,
}

/// Per-status counts over a set of keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn outstanding(&self) -> i64 {
        self.pending + self.processing
    }

    pub fn finished(&self) -> i64 {
        self.completed + self.failed
    }

    pub fn add(&mut self, status: QueueStatus) {
        match status {
            QueueStatus::Pending => self.pending += 1,
            QueueStatus::Processing => self.processing += 1,
            QueueStatus::Completed => self.completed += 1,
            QueueStatus::Failed => self.failed += 1,
        }
    }
}
