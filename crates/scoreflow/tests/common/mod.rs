#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scoreflow::convergence::{
    ConvergenceDeps, ConvergenceSettings, ConvergenceState, ConvergenceStatus, Invalidator,
};
use scoreflow::deals::{Deal, MemoryDealStore};
use scoreflow::discovery::{CandidateDiscovery, DiscoveredCandidate, DiscoveryRequest};
use scoreflow::queue::{MemoryQueueStore, TriggerSummary, WorkQueue, WorkerTrigger};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::watch;
use uuid::Uuid;

/// `None` when TEST_DATABASE_URL is not set; callers skip.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL missing; skipping Postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query(
        r#"
        TRUNCATE TABLE
            queue_items,
            major_operations,
            candidates,
            deal_scores,
            group_deals,
            processing_groups,
            deals
        "#,
    )
    .execute(&pool)
    .await
    .expect("truncate failed");

    Some(pool)
}

/// Counts invocations and answers with a fixed summary.
#[derive(Default)]
pub struct CountingTrigger {
    calls: AtomicUsize,
    summary: TriggerSummary,
}

impl CountingTrigger {
    pub fn with_summary(summary: TriggerSummary) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            summary,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerTrigger for CountingTrigger {
    async fn invoke(&self, _queue: &str) -> anyhow::Result<TriggerSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.summary)
    }
}

pub struct FailingTrigger;

#[async_trait]
impl WorkerTrigger for FailingTrigger {
    async fn invoke(&self, _queue: &str) -> anyhow::Result<TriggerSummary> {
        anyhow::bail!("worker endpoint unreachable")
    }
}

pub struct StaticDiscovery(pub Vec<DiscoveredCandidate>);

#[async_trait]
impl CandidateDiscovery for StaticDiscovery {
    fn source(&self) -> &str {
        "static"
    }

    async fn discover(&self, _req: &DiscoveryRequest) -> anyhow::Result<Vec<DiscoveredCandidate>> {
        Ok(self.0.clone())
    }
}

pub struct FailingDiscovery;

#[async_trait]
impl CandidateDiscovery for FailingDiscovery {
    fn source(&self) -> &str {
        "failing"
    }

    async fn discover(&self, _req: &DiscoveryRequest) -> anyhow::Result<Vec<DiscoveredCandidate>> {
        anyhow::bail!("search backend returned garbage")
    }
}

#[derive(Default)]
pub struct RecordingInvalidator {
    seen: Mutex<Vec<Uuid>>,
}

impl RecordingInvalidator {
    pub fn seen(&self) -> Vec<Uuid> {
        self.seen.lock().unwrap().clone()
    }
}

impl Invalidator for RecordingInvalidator {
    fn invalidate(&self, entity_id: Uuid) {
        self.seen.lock().unwrap().push(entity_id);
    }
}

pub fn candidate(name: &str, website: &str) -> DiscoveredCandidate {
    DiscoveredCandidate {
        name: name.to_string(),
        website: Some(website.to_string()),
        already_known: false,
    }
}

pub fn test_settings() -> ConvergenceSettings {
    ConvergenceSettings {
        link_batch_size: 50,
        candidate_batch_size: 25,
        poll_interval: Duration::from_secs(4),
        max_polls: 5,
        resume_check_interval: Duration::from_secs(10),
    }
}

/// Memory-backed collaborators for the convergence workflow.
pub struct Harness {
    pub deals: Arc<MemoryDealStore>,
    pub queue_store: Arc<MemoryQueueStore>,
    pub trigger: Arc<CountingTrigger>,
    pub invalidator: Arc<RecordingInvalidator>,
    pub deps: ConvergenceDeps,
}

impl Harness {
    pub fn new(discovery: Arc<dyn CandidateDiscovery>) -> Self {
        let deals = Arc::new(MemoryDealStore::new());
        let queue_store = Arc::new(MemoryQueueStore::new());
        let trigger = Arc::new(CountingTrigger::default());
        let invalidator = Arc::new(RecordingInvalidator::default());
        let deps = ConvergenceDeps {
            deals: deals.clone(),
            queue: WorkQueue::new(queue_store.clone(), trigger.clone()),
            discovery,
            invalidator: invalidator.clone(),
            settings: test_settings(),
        };
        Self {
            deals,
            queue_store,
            trigger,
            invalidator,
            deps,
        }
    }

    /// A deal with enough attributes to build a discovery query.
    pub async fn deal(&self) -> Uuid {
        let id = Uuid::new_v4();
        let mut deal = Deal::new(id, "Project Falcon");
        deal.industry = Some("HVAC services".into());
        deal.geography = Some("Texas".into());
        deal.revenue_usd = Some(25_000_000);
        self.deals.add_deal(deal).await;
        id
    }

    pub async fn groups(&self, n: usize) -> Vec<Uuid> {
        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            ids.push(self.deals.add_group(&format!("universe-{i}")).await);
        }
        ids
    }
}

/// Wait (on the paused clock) until the session publishes `state`.
pub async fn wait_for_state(
    rx: &mut watch::Receiver<ConvergenceStatus>,
    state: ConvergenceState,
) -> ConvergenceStatus {
    let status = tokio::time::timeout(
        Duration::from_secs(3600),
        rx.wait_for(|s| s.state == state),
    )
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
    .expect("session dropped");
    status.clone()
}

pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("condition not met in time");
}
