use std::env;

use scoreflow::ledger::{LedgerRepo, LedgerStore, OperationStatus};
use scoreflow::queue::{QueueRepo, QueueStore, SCORING_QUEUE};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

const USAGE: &str = "scoreflowctl <command>\n\
     Commands:\n\
     - reset\n\
     - operations [queued|running|completed|failed]\n\
     - queue <deal_id>\n\
     - finish <operation_id> <completed|failed>\n\
     \n\
     Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL or TEST_DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await?;

    match args[1].as_str() {
        "reset" => reset(&pool).await?,
        "operations" => {
            let status = match args.get(2) {
                Some(s) => Some(
                    OperationStatus::parse(s)
                        .ok_or_else(|| anyhow::anyhow!("unknown status {s:?}"))?,
                ),
                None => None,
            };
            list_operations(&pool, status).await?;
        }
        "queue" => {
            let id = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: scoreflowctl queue <deal_id>"))?;
            show_queue(&pool, id.parse()?).await?;
        }
        "finish" => {
            let (Some(id), Some(status)) = (args.get(2), args.get(3)) else {
                anyhow::bail!("usage: scoreflowctl finish <operation_id> <completed|failed>");
            };
            let status = OperationStatus::parse(status)
                .filter(OperationStatus::is_terminal)
                .ok_or_else(|| anyhow::anyhow!("status must be completed or failed"))?;
            finish(&pool, id.parse()?, status).await?;
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        TRUNCATE TABLE
            queue_items,
            major_operations,
            candidates,
            deal_scores,
            group_deals
        "#,
    )
    .execute(pool)
    .await?;

    println!("reset OK");
    Ok(())
}

async fn list_operations(pool: &PgPool, status: Option<OperationStatus>) -> anyhow::Result<()> {
    let ops = LedgerRepo::new(pool.clone()).list(status, 50).await?;
    if ops.is_empty() {
        println!("(no operations)");
    }
    for op in ops {
        println!(
            "{}  {:<10} {:<12} {:>3}%  {}/{}  owner={}  {}",
            op.id,
            op.status.as_str(),
            op.operation_type,
            op.percent(),
            op.completed_items,
            op.total_items,
            op.owner,
            op.description
        );
    }
    Ok(())
}

async fn show_queue(pool: &PgPool, deal_id: Uuid) -> anyhow::Result<()> {
    let items = QueueRepo::new(pool.clone())
        .list_for_entity(SCORING_QUEUE, deal_id)
        .await?;
    if items.is_empty() {
        println!("(no scoring items for {deal_id})");
    }
    for item in items {
        println!(
            "{}  {:<10} attempts={}  queued_at={}  error={}",
            item.target.as_key(),
            item.status.as_str(),
            item.attempts,
            item.queued_at,
            item.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Finish a stuck operation by hand; the daemon's reaper then promotes the
/// next queued one.
async fn finish(pool: &PgPool, id: Uuid, status: OperationStatus) -> anyhow::Result<()> {
    let changed = LedgerRepo::new(pool.clone()).finish(id, status).await?;
    if changed {
        println!("operation {id} -> {}", status.as_str());
    } else {
        println!("operation {id} was not queued or running; nothing changed");
    }
    Ok(())
}
