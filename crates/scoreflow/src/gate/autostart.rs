use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::gate::AdmissionGate;
use crate::ledger::MajorOperation;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type AutoStartFn = dyn Fn(MajorOperation) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Callbacks that re-issue deferred work, keyed by operation type.
///
/// A queued operation only carries its `context`; the callback registered for
/// its type is what turns that context back into real work once the gate
/// promotes it.
#[derive(Default)]
pub struct AutoStartRegistry {
    callbacks: RwLock<HashMap<String, Arc<AutoStartFn>>>,
}

impl AutoStartRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any callback already registered for `operation_type`.
    pub fn register<F>(&self, operation_type: &str, callback: F)
    where
        F: Fn(MajorOperation) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation_type.to_string(), Arc::new(callback));
    }

    pub fn contains(&self, operation_type: &str) -> bool {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(operation_type)
    }

    /// Run the callback for a freshly promoted operation.
    pub async fn dispatch(&self, op: MajorOperation) -> anyhow::Result<()> {
        let callback = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&op.operation_type)
            .cloned();

        match callback {
            Some(cb) => cb(op).await,
            None => anyhow::bail!(
                "no auto-start callback registered for operation type {:?}",
                op.operation_type
            ),
        }
    }
}

/// Periodically promote the oldest queued operation.
///
/// `complete_operation` already promotes eagerly; this loop covers callers
/// that finished work without going through the gate, and crashed owners
/// whose rows were finished by an operator.
pub async fn run_reaper(gate: Arc<AdmissionGate>, interval: Duration) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match gate.promote_next().await {
            Ok(Some(op)) => tracing::info!(
                operation_id = %op.id,
                operation_type = %op.operation_type,
                "reaper promoted queued operation"
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "reaper promotion failed"),
        }
    }
}
