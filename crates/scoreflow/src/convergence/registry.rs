use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::convergence::session::{ConvergenceDeps, ConvergenceSession};
use crate::convergence::state::{ConvergenceState, ConvergenceStatus};

/// One session per deal, for callers without a session of their own (the
/// admin API).
///
/// Sessions are only created by [`SessionRegistry::ensure_converged`]. A
/// session whose run has finished is retired on the next ensure request,
/// so a deal that errored can be retried.
pub struct SessionRegistry {
    deps: ConvergenceDeps,
    sessions: Mutex<HashMap<Uuid, Arc<ConvergenceSession>>>,
}

impl SessionRegistry {
    pub fn new(deps: ConvergenceDeps) -> Self {
        Self {
            deps,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a run for `deal_id` unless one is in flight.
    ///
    /// Returns whether a run was triggered, plus the status right after.
    pub fn ensure_converged(&self, deal_id: Uuid) -> (bool, ConvergenceStatus) {
        let session = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(old) = sessions.get(&deal_id) {
                if is_finished(old.status().state) {
                    old.teardown();
                    sessions.remove(&deal_id);
                }
            }
            sessions
                .entry(deal_id)
                .or_insert_with(|| {
                    let session = ConvergenceSession::new(self.deps.clone());
                    session.set_entity(Some(deal_id));
                    Arc::new(session)
                })
                .clone()
        };

        let triggered = session.ensure_converged();
        (triggered, session.status())
    }

    /// Manual completion check. Deals without a session get a one-off
    /// result lookup; no session is created for them.
    pub async fn check_now(&self, deal_id: Uuid) -> anyhow::Result<ConvergenceStatus> {
        if let Some(session) = self.get(deal_id) {
            return session.check_now().await;
        }

        let mut status = ConvergenceStatus::idle(Some(deal_id));
        if self.deps.deals.has_result(deal_id).await? {
            status.advance(ConvergenceState::Done, "Scores available");
        }
        Ok(status)
    }

    pub fn get(&self, deal_id: Uuid) -> Option<Arc<ConvergenceSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&deal_id)
            .cloned()
    }

    /// Tear down and forget the session for `deal_id`.
    pub fn remove(&self, deal_id: Uuid) -> bool {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&deal_id);
        match removed {
            Some(session) => {
                session.teardown();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// States after which the session has no work left. `still_processing` is
/// not one of them: `check_now` can restart its polling.
fn is_finished(state: ConvergenceState) -> bool {
    matches!(
        state,
        ConvergenceState::Done | ConvergenceState::NoGroups | ConvergenceState::Error
    )
}
