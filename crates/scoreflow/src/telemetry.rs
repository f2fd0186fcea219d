//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize process-wide logging.
///
/// Filter comes from `RUST_LOG` (default `info`). Set `SCOREFLOW_LOG_JSON=1`
/// for one JSON object per line. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("SCOREFLOW_LOG_JSON")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);

    if json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }
}
