use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The entity being driven to convergence.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Deal {
    pub id: Uuid,
    pub title: String,
    pub industry: Option<String>,
    pub geography: Option<String>,
    pub revenue_usd: Option<i64>,
    pub ebitda_usd: Option<i64>,
    pub website: Option<String>,
    /// Extra search terms curated per deal, appended to discovery queries.
    pub search_qualifiers: Vec<String>,
}

impl Deal {
    pub fn new(id: Uuid, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            industry: None,
            geography: None,
            revenue_usd: None,
            ebitda_usd: None,
            website: None,
            search_qualifiers: Vec::new(),
        }
    }
}

/// A buyer universe a deal must be scored against.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessingGroup {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Provenance {
    pub source: String,
    pub origin_deal_id: Uuid,
    pub discovered_at: DateTime<Utc>,
    pub query: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewCandidate {
    pub identity_key: String,
    pub name: String,
    pub website: Option<String>,
    pub provenance: Provenance,
}

/// Dedupe key for a candidate: bare lowercase host when a website is known
/// (`https://www.Acme.com/about` -> `acme.com`), otherwise the trimmed,
/// lowercased name. `None` when neither yields anything.
pub fn candidate_key(name: &str, website: Option<&str>) -> Option<String> {
    if let Some(host) = website.and_then(normalize_host) {
        return Some(host);
    }
    let name = name.trim().to_lowercase();
    (!name.is_empty()).then_some(name)
}

fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let url = reqwest::Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    (!host.is_empty()).then(|| host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefers_normalized_host() {
        assert_eq!(
            candidate_key("Acme Holdings", Some("https://www.Acme.com/about?x=1")).as_deref(),
            Some("acme.com")
        );
        assert_eq!(
            candidate_key("Acme", Some("acme.com")).as_deref(),
            Some("acme.com")
        );
    }

    #[test]
    fn key_falls_back_to_name() {
        assert_eq!(
            candidate_key("  Acme Holdings ", None).as_deref(),
            Some("acme holdings")
        );
        assert_eq!(candidate_key("Acme", Some("   ")).as_deref(), Some("acme"));
        assert_eq!(candidate_key("  ", None), None);
    }
}
