use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::deals::{candidate_key, Deal};

/// Appended to every query; these aggregators crowd out real companies.
const EXCLUSIONS: &[&str] = &["-zoominfo", "-dnb"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryHints {
    pub domain: Option<String>,
    pub geography: Option<String>,
    pub scale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryRequest {
    pub query: String,
    pub hints: DiscoveryHints,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredCandidate {
    pub name: String,
    pub website: Option<String>,
    pub already_known: bool,
}

/// External search for additional buyer candidates. Callers treat every
/// error as non-fatal.
#[async_trait]
pub trait CandidateDiscovery: Send + Sync {
    /// Recorded as `source` in candidate provenance.
    fn source(&self) -> &str;

    async fn discover(&self, req: &DiscoveryRequest) -> anyhow::Result<Vec<DiscoveredCandidate>>;
}

/// Revenue band wording used in queries.
pub fn scale_band(revenue_usd: i64) -> &'static str {
    match revenue_usd {
        r if r < 10_000_000 => "small business",
        r if r < 100_000_000 => "mid-market",
        _ => "large",
    }
}

/// Synthesize a search query from what is known about the deal. `None` when
/// the deal has nothing to search on.
pub fn build_query(deal: &Deal) -> Option<DiscoveryRequest> {
    let domain = non_empty(deal.industry.as_deref()).or_else(|| non_empty(Some(&deal.title)))?;
    let geography = non_empty(deal.geography.as_deref());
    let scale = deal.revenue_usd.filter(|r| *r > 0).map(scale_band);

    let mut parts: Vec<&str> = Vec::new();
    if let Some(s) = scale {
        parts.push(s);
    }
    parts.push(domain);
    parts.push("companies acquirers");
    if let Some(g) = geography {
        parts.push(g);
    }
    parts.extend(
        deal.search_qualifiers
            .iter()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty()),
    );
    parts.extend_from_slice(EXCLUSIONS);

    Some(DiscoveryRequest {
        query: parts.join(" "),
        hints: DiscoveryHints {
            domain: Some(domain.to_string()),
            geography: geography.map(str::to_string),
            scale: scale.map(str::to_string),
        },
    })
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Used when no search key is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledDiscovery;

#[async_trait]
impl CandidateDiscovery for DisabledDiscovery {
    fn source(&self) -> &str {
        "disabled"
    }

    async fn discover(&self, _req: &DiscoveryRequest) -> anyhow::Result<Vec<DiscoveredCandidate>> {
        Ok(Vec::new())
    }
}

#[derive(Serialize)]
struct SerperRequest<'a> {
    q: &'a str,
    gl: &'a str,
    autocorrect: bool,
    num: u32,
}

#[derive(Debug, Default, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<OrganicResult>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
}

/// Google search through a Serper-compatible endpoint.
#[derive(Clone)]
pub struct SerperDiscovery {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl SerperDiscovery {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl CandidateDiscovery for SerperDiscovery {
    fn source(&self) -> &str {
        "serper"
    }

    async fn discover(&self, req: &DiscoveryRequest) -> anyhow::Result<Vec<DiscoveredCandidate>> {
        let payload = SerperRequest {
            q: &req.query,
            gl: "us",
            autocorrect: false,
            num: 10,
        };

        let resp = match self
            .client
            .post(&self.url)
            .header("X-API-KEY", &self.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(query = %req.query, error = %e, "search request failed");
                return Ok(Vec::new());
            }
        };

        if !resp.status().is_success() {
            tracing::warn!(query = %req.query, status = %resp.status(), "search returned error status");
            return Ok(Vec::new());
        }

        let body: SerperResponse = resp.json().await?;
        Ok(candidates_from(body))
    }
}

/// One candidate per distinct site, in result order.
fn candidates_from(body: SerperResponse) -> Vec<DiscoveredCandidate> {
    let mut seen = HashSet::new();
    body.organic
        .into_iter()
        .filter_map(|r| {
            let name = r.title.trim().to_string();
            let website = reqwest::Url::parse(r.link.trim())
                .ok()
                .and_then(|u| u.host_str().map(str::to_string));
            let key = candidate_key(&name, website.as_deref())?;
            seen.insert(key).then_some(DiscoveredCandidate {
                name,
                website,
                already_known: false,
            })
        })
        .collect()
}
