//! Payment gateway adapters.
//!
//! [`StripeGateway`] talks to a Stripe-compatible REST API: active
//! subscriptions are found by the `owner_id` metadata key set at checkout and
//! cancelled one by one. [`UnconfiguredGateway`] is used when no billing
//! section is configured; it reports no subscriptions.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use rsd_handover::ports::PaymentGateway;
use rsd_handover::types::{AccountId, SubscriptionId};

pub const DEFAULT_BASE_URL: &str = "https://api.stripe.com";

/// Search pages are capped; an owner with more active subscriptions than
/// this is a data problem worth surfacing.
const MAX_SEARCH_PAGES: usize = 20;
const PAGE_LIMIT: &str = "100";

#[derive(Clone)]
pub struct StripeGateway {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for StripeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeGateway")
            .field("api_key", &"<REDACTED>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl StripeGateway {
    pub fn new(api_key: String) -> Self {
        Self::new_with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn new_with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            api_key,
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Stripe search query for an owner's active subscriptions.
pub fn owner_search_query(owner: AccountId) -> String {
    format!("status:'active' AND metadata['owner_id']:'{}'", owner)
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn list_active_subscriptions(&self, owner: AccountId) -> Result<Vec<SubscriptionId>> {
        let query = owner_search_query(owner);
        let url = self.url("/v1/subscriptions/search");
        let mut out = Vec::new();
        let mut page: Option<String> = None;

        for _ in 0..MAX_SEARCH_PAGES {
            let mut params = vec![("query", query.as_str()), ("limit", PAGE_LIMIT)];
            if let Some(p) = page.as_deref() {
                params.push(("page", p));
            }

            let resp = self
                .http
                .get(&url)
                .bearer_auth(&self.api_key)
                .query(&params)
                .send()
                .await
                .context("billing subscription search request failed")?;
            let status = resp.status().as_u16();
            let body = resp
                .text()
                .await
                .context("billing subscription search body read failed")?;

            let parsed = parse_search_page(status, &body)?;
            out.extend(parsed.ids);
            match parsed.next_page {
                Some(next) => page = Some(next),
                None => {
                    debug!(%owner, count = out.len(), "active subscriptions listed");
                    return Ok(out);
                }
            }
        }

        Err(anyhow!(
            "billing subscription search exceeded {} pages for owner {}",
            MAX_SEARCH_PAGES,
            owner
        ))
    }

    async fn cancel_subscription(&self, id: &SubscriptionId) -> Result<()> {
        let url = self.url(&format!("/v1/subscriptions/{}", id));
        let resp = self
            .http
            .delete(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .with_context(|| format!("billing cancel request failed for {}", id))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .context("billing cancel body read failed")?;

        check_cancel_response(status, &body)?;
        info!(subscription = %id, "subscription cancelled");
        Ok(())
    }
}

/// Gateway used when billing is not configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredGateway;

#[async_trait]
impl PaymentGateway for UnconfiguredGateway {
    async fn list_active_subscriptions(&self, _owner: AccountId) -> Result<Vec<SubscriptionId>> {
        Ok(Vec::new())
    }

    async fn cancel_subscription(&self, id: &SubscriptionId) -> Result<()> {
        Err(anyhow!("billing is not configured; cannot cancel {}", id))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<SubscriptionObject>,
    #[serde(default)]
    has_more: bool,
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

impl ApiError {
    fn describe(&self) -> String {
        let kind = self.kind.as_deref().unwrap_or("unknown");
        match (&self.code, &self.message) {
            (Some(c), Some(m)) => format!("{} code={} {}", kind, c, m),
            (_, Some(m)) => format!("{} {}", kind, m),
            _ => kind.to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct SearchPage {
    pub ids: Vec<SubscriptionId>,
    pub next_page: Option<String>,
}

fn http_error(status: u16, body: &str) -> anyhow::Error {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => anyhow!("billing http error status={} {}", status, env.error.describe()),
        Err(_) => anyhow!("billing http error status={}", status),
    }
}

/// Decode one search page. Non-active entries are dropped defensively.
pub fn parse_search_page(status: u16, body: &str) -> Result<SearchPage> {
    if !(200..300).contains(&status) {
        return Err(http_error(status, body));
    }
    let parsed: SearchResponse =
        serde_json::from_str(body).context("billing search response json decode failed")?;
    let ids = parsed
        .data
        .into_iter()
        .filter(|s| s.status == "active")
        .map(|s| SubscriptionId(s.id))
        .collect();
    let next_page = if parsed.has_more { parsed.next_page } else { None };
    Ok(SearchPage { ids, next_page })
}

/// A cancel of an already-cancelled subscription counts as done.
pub fn check_cancel_response(status: u16, body: &str) -> Result<()> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    if status == 404 {
        if let Ok(env) = serde_json::from_str::<ErrorEnvelope>(body) {
            if env.error.code.as_deref() == Some("resource_missing") {
                return Ok(());
            }
        }
    }
    Err(http_error(status, body))
}
