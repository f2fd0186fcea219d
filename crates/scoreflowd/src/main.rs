use std::sync::Arc;
use std::time::Duration;

use scoreflow::api;
use scoreflow::bulk::BulkOperations;
use scoreflow::config;
use scoreflow::convergence::{
    BroadcastInvalidator, ConvergenceDeps, ConvergenceSettings, SessionRegistry,
};
use scoreflow::db;
use scoreflow::deals::DealsRepo;
use scoreflow::discovery::{CandidateDiscovery, DisabledDiscovery, SerperDiscovery};
use scoreflow::gate::{run_reaper, AdmissionGate, AutoStartRegistry};
use scoreflow::ledger::LedgerRepo;
use scoreflow::queue::{HttpWorkerTrigger, NoopTrigger, QueueRepo, WorkQueue, WorkerTrigger};
use scoreflow::telemetry;

const TRIGGER_TIMEOUT: Duration = Duration::from_secs(30);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    telemetry::init();

    tracing::info!(
        admin_addr = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        enqueue_batch_size = cfg.enqueue_batch_size,
        poll_interval_ms = cfg.poll_interval_ms,
        max_polls = cfg.max_polls,
        reaper_interval_ms = cfg.reaper_interval_ms,
        worker_trigger = cfg.worker_trigger_url.is_some(),
        discovery = cfg.discovery_api_key.is_some(),
        "scoreflowd starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let trigger: Arc<dyn WorkerTrigger> = match &cfg.worker_trigger_url {
        Some(url) => Arc::new(HttpWorkerTrigger::new(url.clone(), TRIGGER_TIMEOUT)?),
        None => Arc::new(NoopTrigger),
    };
    let discovery: Arc<dyn CandidateDiscovery> = match &cfg.discovery_api_key {
        Some(key) => Arc::new(SerperDiscovery::new(
            cfg.discovery_url.clone(),
            key.clone(),
            DISCOVERY_TIMEOUT,
        )?),
        None => Arc::new(DisabledDiscovery),
    };

    let deals = Arc::new(DealsRepo::new(pool.clone()));
    let queue = WorkQueue::new(Arc::new(QueueRepo::new(pool.clone())), trigger)
        .with_batch_size(cfg.enqueue_batch_size);
    let gate = AdmissionGate::new(
        Arc::new(LedgerRepo::new(pool.clone())),
        Arc::new(AutoStartRegistry::new()),
    );

    let bulk = BulkOperations::new(
        gate.clone(),
        queue.clone(),
        deals.clone(),
        cfg.poll_interval(),
        cfg.max_polls,
    );
    bulk.register_autostart();

    let invalidator = BroadcastInvalidator::new(256);
    // Embedders attach their cache owners with `subscribe`; the daemon
    // itself only records each convergence.
    invalidator.spawn_forwarder(|entity_id| {
        tracing::info!(entity_id = %entity_id, "deal converged; invalidation published");
    });
    let sessions = Arc::new(SessionRegistry::new(ConvergenceDeps {
        deals,
        queue,
        discovery,
        invalidator: Arc::new(invalidator),
        settings: ConvergenceSettings::from(&cfg),
    }));

    // ---- API task ----
    let app = api::router(api::ApiState {
        gate: gate.clone(),
        bulk,
        sessions,
    });
    let api_addr = cfg.admin_addr.clone();
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "admin api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Reaper task ----
    let reaper_handle = tokio::spawn(run_reaper(Arc::new(gate), cfg.reaper_interval()));

    tokio::select! {
        res = api_handle => {
            res??;
        }
        res = reaper_handle => {
            res??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    Ok(())
}
