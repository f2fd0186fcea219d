use std::time::Duration;

// Central place for runtime configuration, loaded from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,

    pub enqueue_batch_size: usize,
    pub link_batch_size: usize,
    pub candidate_batch_size: usize,

    pub poll_interval_ms: u64,
    pub max_polls: u32,
    pub resume_check_interval_ms: u64,
    pub reaper_interval_ms: u64,

    pub worker_trigger_url: Option<String>,
    pub discovery_url: String,
    pub discovery_api_key: Option<String>,
}

pub const DEFAULT_DISCOVERY_URL: &str = "https://google.serper.dev/search";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let admin_addr = env_or_fallback("SCOREFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("SCOREFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let enqueue_batch_size = env_parse("SCOREFLOW_ENQUEUE_BATCH_SIZE")
            .unwrap_or(500usize)
            .clamp(1, 5_000);
        let link_batch_size = env_parse("SCOREFLOW_LINK_BATCH_SIZE")
            .unwrap_or(50usize)
            .clamp(1, 1_000);
        let candidate_batch_size = env_parse("SCOREFLOW_CANDIDATE_BATCH_SIZE")
            .unwrap_or(25usize)
            .clamp(1, 1_000);

        let poll_interval_ms = env_parse("SCOREFLOW_POLL_INTERVAL_MS").unwrap_or(4_000u64);
        let max_polls = env_parse("SCOREFLOW_MAX_POLLS").unwrap_or(150u32);
        let resume_check_interval_ms =
            env_parse("SCOREFLOW_RESUME_CHECK_INTERVAL_MS").unwrap_or(10_000u64);
        let reaper_interval_ms = env_parse("SCOREFLOW_REAPER_INTERVAL_MS").unwrap_or(5_000u64);

        let worker_trigger_url = env_or_fallback("SCOREFLOW_WORKER_TRIGGER_URL", "WORKER_TRIGGER_URL")
            .and_then(|s| normalize_optional_addr(&s));

        let discovery_url = env_or_fallback("SCOREFLOW_DISCOVERY_URL", "DISCOVERY_URL")
            .unwrap_or_else(|| DEFAULT_DISCOVERY_URL.to_string());
        let discovery_api_key = env_or_fallback("SCOREFLOW_DISCOVERY_API_KEY", "SERPER_API_KEY");

        Ok(Self {
            database_url,
            admin_addr,
            migrate_on_startup,
            enqueue_batch_size,
            link_batch_size,
            candidate_batch_size,
            poll_interval_ms,
            max_polls,
            resume_check_interval_ms,
            reaper_interval_ms,
            worker_trigger_url,
            discovery_url,
            discovery_api_key,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn resume_check_interval(&self) -> Duration {
        Duration::from_millis(self.resume_check_interval_ms.max(1))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(1))
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
