use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::Config;
use crate::convergence::state::{ConvergenceState, ConvergenceStatus, RunCounters};
use crate::convergence::workflow::{run_steps, StepReporter, StepsOutcome};
use crate::deals::DealStore;
use crate::discovery::CandidateDiscovery;
use crate::queue::{WorkQueue, SCORING_QUEUE};

/// Downstream notification fired when an entity reaches `done`.
pub trait Invalidator: Send + Sync {
    fn invalidate(&self, entity_id: Uuid);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidator;

impl Invalidator for NoopInvalidator {
    fn invalidate(&self, _entity_id: Uuid) {}
}

/// Fans invalidations out to any number of cache owners.
#[derive(Debug, Clone)]
pub struct BroadcastInvalidator {
    tx: broadcast::Sender<Uuid>,
}

impl BroadcastInvalidator {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Uuid> {
        self.tx.subscribe()
    }

    /// Subscribe and hand every invalidation to `sink` until all senders
    /// are gone. A lagging receiver skips what it missed.
    pub fn spawn_forwarder<F>(&self, sink: F) -> JoinHandle<()>
    where
        F: Fn(Uuid) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(entity_id) => sink(entity_id),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "invalidation receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}

impl Invalidator for BroadcastInvalidator {
    fn invalidate(&self, entity_id: Uuid) {
        // no subscribers is fine
        let _ = self.tx.send(entity_id);
    }
}

#[derive(Debug, Clone)]
pub struct ConvergenceSettings {
    pub link_batch_size: usize,
    pub candidate_batch_size: usize,
    pub poll_interval: Duration,
    /// Polls before giving up with `still_processing`.
    pub max_polls: u32,
    pub resume_check_interval: Duration,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            link_batch_size: 50,
            candidate_batch_size: 25,
            poll_interval: Duration::from_secs(4),
            max_polls: 150,
            resume_check_interval: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for ConvergenceSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            link_batch_size: cfg.link_batch_size,
            candidate_batch_size: cfg.candidate_batch_size,
            poll_interval: cfg.poll_interval(),
            max_polls: cfg.max_polls,
            resume_check_interval: cfg.resume_check_interval(),
        }
    }
}

#[derive(Clone)]
pub struct ConvergenceDeps {
    pub deals: Arc<dyn DealStore>,
    pub queue: WorkQueue,
    pub discovery: Arc<dyn CandidateDiscovery>,
    pub invalidator: Arc<dyn Invalidator>,
    pub settings: ConvergenceSettings,
}

/// Drives one entity at a time to convergence.
///
/// Every spawned task captures the entity and generation it was started
/// for; a write from a task whose capture no longer matches is dropped.
/// `set_entity` and `teardown` bump the generation and abort the tasks.
pub struct ConvergenceSession {
    shared: Arc<Shared>,
}

struct Shared {
    deps: ConvergenceDeps,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<ConvergenceStatus>,
}

#[derive(Default)]
struct Inner {
    entity: Option<Uuid>,
    generation: u64,
    /// At-most-once latch for the current entity.
    triggered: bool,
    run: Option<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
    resume: Option<JoinHandle<()>>,
}

impl Inner {
    fn is_current(&self, entity: Uuid, generation: u64) -> bool {
        self.generation == generation && self.entity == Some(entity)
    }

    fn abort_tasks(&mut self) {
        for handle in [self.run.take(), self.poll.take(), self.resume.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

impl ConvergenceSession {
    pub fn new(deps: ConvergenceDeps) -> Self {
        let (status_tx, _) = watch::channel(ConvergenceStatus::idle(None));
        Self {
            shared: Arc::new(Shared {
                deps,
                inner: Mutex::new(Inner::default()),
                status_tx,
            }),
        }
    }

    /// Point the session at `entity`. A change cancels all work for the
    /// previous entity, clears the latch and starts the resume watcher.
    pub fn set_entity(&self, entity: Option<Uuid>) {
        let mut inner = self.shared.lock();
        if inner.entity == entity {
            return;
        }
        inner.abort_tasks();
        inner.generation += 1;
        inner.entity = entity;
        inner.triggered = false;
        self.shared
            .status_tx
            .send_replace(ConvergenceStatus::idle(entity));

        if let Some(id) = entity {
            let generation = inner.generation;
            inner.resume = Some(tokio::spawn(watch_for_resume(
                self.shared.clone(),
                id,
                generation,
            )));
        }
    }

    pub fn entity(&self) -> Option<Uuid> {
        self.shared.lock().entity
    }

    /// Run the convergence steps for the current entity in the background.
    ///
    /// Returns false without doing anything when no entity is set or the
    /// sequence already ran (or is running) for this entity.
    pub fn ensure_converged(&self) -> bool {
        let mut inner = self.shared.lock();
        let Some(entity) = inner.entity else {
            return false;
        };
        if inner.triggered {
            return false;
        }
        inner.triggered = true;
        if let Some(h) = inner.resume.take() {
            h.abort();
        }

        let generation = inner.generation;
        inner.run = Some(tokio::spawn(run_sequence(
            self.shared.clone(),
            entity,
            generation,
        )));
        true
    }

    /// Manual completion check. Restarts polling when the poll budget had
    /// run out and the result is still missing.
    pub async fn check_now(&self) -> anyhow::Result<ConvergenceStatus> {
        let (entity, generation) = {
            let inner = self.shared.lock();
            let entity = inner
                .entity
                .ok_or_else(|| anyhow::anyhow!("no entity selected"))?;
            (entity, inner.generation)
        };

        if self.shared.deps.deals.has_result(entity).await? {
            self.shared.complete(entity, generation, "Scores available");
        } else if self.status().state == ConvergenceState::StillProcessing
            && self.shared.update(entity, generation, |s| {
                s.advance(ConvergenceState::Scoring, "Waiting for scores");
                s.counters.polls = 0;
            })
        {
            start_polling(&self.shared, entity, generation);
        }

        Ok(self.status())
    }

    /// Cancel everything and forget the entity.
    pub fn teardown(&self) {
        let mut inner = self.shared.lock();
        inner.abort_tasks();
        inner.generation += 1;
        inner.entity = None;
        inner.triggered = false;
        self.shared
            .status_tx
            .send_replace(ConvergenceStatus::idle(None));
    }

    pub fn status(&self) -> ConvergenceStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConvergenceStatus> {
        self.shared.status_tx.subscribe()
    }
}

impl Drop for ConvergenceSession {
    fn drop(&mut self) {
        self.shared.lock().abort_tasks();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the published status if `(entity, generation)` is still
    /// current. The check and the write happen under one lock.
    fn update(
        &self,
        entity: Uuid,
        generation: u64,
        f: impl FnOnce(&mut ConvergenceStatus),
    ) -> bool {
        let inner = self.lock();
        if !inner.is_current(entity, generation) {
            return false;
        }
        self.status_tx.send_modify(f);
        true
    }

    fn is_current(&self, entity: Uuid, generation: u64) -> bool {
        self.lock().is_current(entity, generation)
    }

    /// Move to `done` once, stop polling and notify downstream.
    fn complete(&self, entity: Uuid, generation: u64, message: &str) -> bool {
        {
            let mut inner = self.lock();
            if !inner.is_current(entity, generation) {
                return false;
            }
            if self.status_tx.borrow().state == ConvergenceState::Done {
                return false;
            }
            if let Some(h) = inner.poll.take() {
                h.abort();
            }
            self.status_tx
                .send_modify(|s| s.advance(ConvergenceState::Done, message));
        }

        tracing::info!(entity_id = %entity, "entity converged");
        self.deps.invalidator.invalidate(entity);
        true
    }
}

struct SessionReporter {
    shared: Arc<Shared>,
    entity: Uuid,
    generation: u64,
    counters: RunCounters,
}

impl StepReporter for SessionReporter {
    fn advance(&mut self, state: ConvergenceState, message: &str) -> bool {
        let counters = self.counters;
        self.shared.update(self.entity, self.generation, |s| {
            s.counters = counters;
            s.advance(state, message);
        })
    }

    fn counters(&mut self) -> &mut RunCounters {
        &mut self.counters
    }
}

async fn run_sequence(shared: Arc<Shared>, entity: Uuid, generation: u64) {
    let mut reporter = SessionReporter {
        shared: shared.clone(),
        entity,
        generation,
        counters: RunCounters::default(),
    };

    let outcome = run_steps(&shared.deps, entity, &mut reporter).await;
    tracing::debug!(entity_id = %entity, ?outcome, "convergence steps finished");

    match outcome {
        StepsOutcome::NoGroups => {
            reporter.advance(ConvergenceState::NoGroups, "No active processing groups");
        }
        StepsOutcome::AlreadyDone => {
            shared.update(entity, generation, |s| s.counters = reporter.counters);
            shared.complete(entity, generation, "Scores already available");
        }
        StepsOutcome::NeedsScoring => {
            if reporter.advance(ConvergenceState::Scoring, "Waiting for scores") {
                start_polling(&shared, entity, generation);
            }
        }
        StepsOutcome::Failed(message) => {
            tracing::warn!(entity_id = %entity, error = %message, "convergence run failed");
            reporter.advance(ConvergenceState::Error, &message);
        }
        StepsOutcome::Superseded => {}
    }
}

fn start_polling(shared: &Arc<Shared>, entity: Uuid, generation: u64) {
    let mut inner = shared.lock();
    if !inner.is_current(entity, generation) {
        return;
    }
    if let Some(h) = inner.poll.take() {
        h.abort();
    }
    inner.poll = Some(tokio::spawn(poll_for_result(
        shared.clone(),
        entity,
        generation,
    )));
}

async fn poll_for_result(shared: Arc<Shared>, entity: Uuid, generation: u64) {
    let period = shared.deps.settings.poll_interval;
    let max_polls = shared.deps.settings.max_polls;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for n in 1..=max_polls {
        ticker.tick().await;
        if !shared.is_current(entity, generation) {
            return;
        }

        let found = match shared.deps.deals.has_result(entity).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(entity_id = %entity, error = %e, "result poll failed");
                false
            }
        };

        if !shared.update(entity, generation, |s| s.counters.polls = n) {
            return;
        }
        if found {
            shared.complete(entity, generation, "Scores available");
            return;
        }
    }

    tracing::info!(entity_id = %entity, max_polls, "poll budget exhausted");
    shared.update(entity, generation, |s| {
        s.advance(
            ConvergenceState::StillProcessing,
            "Scoring is still in progress; check again later",
        )
    });
}

/// While idle, look for scoring work some other caller already queued for
/// this entity and, if found, jump straight to polling.
async fn watch_for_resume(shared: Arc<Shared>, entity: Uuid, generation: u64) {
    let mut ticker = tokio::time::interval(shared.deps.settings.resume_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let outstanding = match shared
            .deps
            .queue
            .store()
            .count_outstanding(SCORING_QUEUE, entity)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(entity_id = %entity, error = %e, "resume check failed");
                continue;
            }
        };
        if outstanding == 0 {
            continue;
        }

        {
            let mut inner = shared.lock();
            if !inner.is_current(entity, generation) || inner.triggered {
                return;
            }
            inner.triggered = true;
            // this task is finishing; detach rather than abort itself
            inner.resume.take();
            shared.status_tx.send_modify(|s| {
                s.advance(ConvergenceState::Scoring, "Resuming in-progress scoring")
            });
        }

        tracing::info!(entity_id = %entity, outstanding, "resuming in-progress scoring run");
        start_polling(&shared, entity, generation);
        return;
    }
}
