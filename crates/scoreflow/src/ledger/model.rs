use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const BULK_SCORE: &str = "bulk-score";
pub const BULK_ENRICH: &str = "bulk-enrich";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Queued => "queued",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(OperationStatus::Queued),
            "running" => Some(OperationStatus::Running),
            "completed" => Some(OperationStatus::Completed),
            "failed" => Some(OperationStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

/// One ledger row.
#[derive(Debug, Clone, Serialize)]
pub struct MajorOperation {
    pub id: Uuid,
    pub operation_type: String,
    pub total_items: i32,
    pub completed_items: i32,
    pub status: OperationStatus,
    pub description: String,
    pub owner: String,
    /// Job parameters; enough to re-issue the work when a queued entry is
    /// promoted.
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MajorOperation {
    pub fn handle(&self) -> OperationHandle {
        OperationHandle { id: self.id }
    }

    /// 0–100, for progress bars.
    pub fn percent(&self) -> u8 {
        if self.total_items <= 0 {
            return if self.status.is_terminal() { 100 } else { 0 };
        }
        let pct = (self.completed_items.max(0) as i64 * 100) / self.total_items as i64;
        pct.clamp(0, 100) as u8
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MajorOperationRequest {
    pub operation_type: String,
    pub total_items: i32,
    pub description: String,
    pub owner: String,
    #[serde(default)]
    pub context: Value,
}

/// Opaque reference to a ledger row, handed to the caller that owns the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationHandle {
    pub id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(total: i32, done: i32, status: OperationStatus) -> MajorOperation {
        MajorOperation {
            id: Uuid::new_v4(),
            operation_type: BULK_SCORE.into(),
            total_items: total,
            completed_items: done,
            status,
            description: String::new(),
            owner: String::new(),
            context: Value::Null,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(op(200, 50, OperationStatus::Running).percent(), 25);
        assert_eq!(op(10, 15, OperationStatus::Running).percent(), 100);
    }

    #[test]
    fn empty_operation_reports_done_only_when_terminal() {
        assert_eq!(op(0, 0, OperationStatus::Running).percent(), 0);
        assert_eq!(op(0, 0, OperationStatus::Completed).percent(), 100);
    }
}
