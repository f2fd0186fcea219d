use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Counts a worker may report back after draining a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSummary {
    #[serde(default)]
    pub processed: Option<u64>,
    #[serde(default)]
    pub synced: Option<u64>,
}

/// Kicks the out-of-process worker that drains a queue.
///
/// Callers treat this as fire-and-forget: a scheduled sweep drains the queue
/// anyway, so an error here is logged and dropped.
#[async_trait]
pub trait WorkerTrigger: Send + Sync {
    async fn invoke(&self, queue: &str) -> anyhow::Result<TriggerSummary>;
}

/// Used when no trigger endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrigger;

#[async_trait]
impl WorkerTrigger for NoopTrigger {
    async fn invoke(&self, _queue: &str) -> anyhow::Result<TriggerSummary> {
        Ok(TriggerSummary::default())
    }
}

#[derive(Serialize)]
struct TriggerRequest<'a> {
    queue: &'a str,
}

/// POSTs `{"queue": ...}` to the worker's trigger endpoint.
#[derive(Clone)]
pub struct HttpWorkerTrigger {
    client: reqwest::Client,
    url: String,
}

impl HttpWorkerTrigger {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl WorkerTrigger for HttpWorkerTrigger {
    async fn invoke(&self, queue: &str) -> anyhow::Result<TriggerSummary> {
        let resp = self
            .client
            .post(&self.url)
            .json(&TriggerRequest { queue })
            .send()
            .await?
            .error_for_status()?;

        // An empty or non-JSON body still counts as a successful kick.
        let body = resp.bytes().await?;
        if body.is_empty() {
            return Ok(TriggerSummary::default());
        }
        Ok(serde_json::from_slice(&body).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::TriggerSummary;

    #[test]
    fn summary_fields_are_optional() {
        let s: TriggerSummary = serde_json::from_str(r#"{"processed": 12}"#).unwrap();
        assert_eq!(s.processed, Some(12));
        assert_eq!(s.synced, None);

        let empty: TriggerSummary = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, TriggerSummary::default());
    }
}
