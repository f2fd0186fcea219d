pub mod autostart;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::ledger::{
    LedgerStore, MajorOperation, MajorOperationRequest, OperationHandle, OperationStatus,
};

pub use autostart::{run_reaper, AutoStartRegistry, BoxFuture};

const FINISH_ATTEMPTS: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Outcome of [`AdmissionGate::register`].
///
/// `started == false` means the request was queued; the caller must not do
/// the work itself. `handle == None` with `started == true` means the ledger
/// was unreachable and the caller proceeds untracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub started: bool,
    pub handle: Option<OperationHandle>,
}

/// Serializes major operations: at most one `running` at a time.
#[derive(Clone)]
pub struct AdmissionGate {
    ledger: Arc<dyn LedgerStore>,
    autostart: Arc<AutoStartRegistry>,
}

impl AdmissionGate {
    pub fn new(ledger: Arc<dyn LedgerStore>, autostart: Arc<AutoStartRegistry>) -> Self {
        Self { ledger, autostart }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn autostart(&self) -> &Arc<AutoStartRegistry> {
        &self.autostart
    }

    pub async fn register(&self, req: MajorOperationRequest) -> Registration {
        match self.ledger.insert_running_if_idle(&req).await {
            Ok(Some(op)) => {
                tracing::info!(
                    operation_id = %op.id,
                    operation_type = %op.operation_type,
                    total_items = op.total_items,
                    "major operation started"
                );
                return Registration {
                    started: true,
                    handle: Some(op.handle()),
                };
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    operation_type = %req.operation_type,
                    error = %e,
                    "ledger unavailable; proceeding without admission tracking"
                );
                return Registration {
                    started: true,
                    handle: None,
                };
            }
        }

        match self.ledger.insert_queued(&req).await {
            Ok(op) => {
                tracing::info!(
                    operation_id = %op.id,
                    operation_type = %op.operation_type,
                    "major operation queued behind running operation"
                );
                Registration {
                    started: false,
                    handle: Some(op.handle()),
                }
            }
            Err(e) => {
                tracing::warn!(
                    operation_type = %req.operation_type,
                    error = %e,
                    "failed to queue major operation; proceeding without admission tracking"
                );
                Registration {
                    started: true,
                    handle: None,
                }
            }
        }
    }

    /// Monotonic: a value below the stored counter is ignored.
    pub async fn update_progress(
        &self,
        handle: &OperationHandle,
        completed_items: i32,
    ) -> anyhow::Result<bool> {
        self.ledger.raise_progress(handle.id, completed_items).await
    }

    /// Terminal transition. Only the first call moves the row; when it does,
    /// the next queued operation is promoted straight away.
    pub async fn complete_operation(
        &self,
        handle: &OperationHandle,
        status: OperationStatus,
    ) -> anyhow::Result<bool> {
        let transitioned = self.ledger.finish(handle.id, status).await?;
        if !transitioned {
            return Ok(false);
        }

        tracing::info!(operation_id = %handle.id, status = status.as_str(), "major operation finished");
        if let Err(e) = self.promote_next().await {
            tracing::warn!(error = %e, "promotion after completion failed; reaper will retry");
        }
        Ok(true)
    }

    /// Promote the oldest queued operation into the free slot and fire its
    /// auto-start callback. An operation whose callback is missing or fails is
    /// marked failed and the next one is tried.
    pub async fn promote_next(&self) -> anyhow::Result<Option<MajorOperation>> {
        loop {
            let Some(op) = self.ledger.promote_oldest_queued().await? else {
                return Ok(None);
            };

            match self.autostart.dispatch(op.clone()).await {
                Ok(()) => {
                    tracing::info!(
                        operation_id = %op.id,
                        operation_type = %op.operation_type,
                        "queued major operation auto-started"
                    );
                    return Ok(Some(op));
                }
                Err(e) => {
                    tracing::warn!(
                        operation_id = %op.id,
                        operation_type = %op.operation_type,
                        error = %e,
                        "auto-start failed; marking operation failed"
                    );
                    self.fail_promoted(&op).await;
                }
            }
        }
    }

    /// Release the slot held by a promoted operation that could not start.
    /// A row left `running` here blocks the gate, so the write is retried.
    async fn fail_promoted(&self, op: &MajorOperation) {
        for attempt in 1..=FINISH_ATTEMPTS {
            match self.ledger.finish(op.id, OperationStatus::Failed).await {
                Ok(_) => return,
                Err(e) if attempt < FINISH_ATTEMPTS => {
                    tracing::warn!(operation_id = %op.id, attempt, error = %e, "failed to mark operation failed; retrying");
                    tokio::time::sleep(FINISH_RETRY_DELAY * attempt).await;
                }
                Err(e) => tracing::error!(
                    operation_id = %op.id,
                    error = %e,
                    "operation left running without work; finish it with scoreflowctl"
                ),
            }
        }
    }
}
