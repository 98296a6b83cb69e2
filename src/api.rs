use crate::error::{MonitorError, Result};
use crate::types::SavedSearch;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde_json::Value;

pub const BLOCKET_API_BASE: &str = "https://api.blocket.se";

/// The marketplace operations the monitor depends on.
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    /// All saved searches of the account, with their current counts.
    async fn list_searches(&self) -> Result<Vec<SavedSearch>>;

    /// Up to `limit` of the most recent listings of one saved search, as raw records.
    async fn fetch_listings(&self, search_id: &str, limit: u32) -> Result<Vec<Value>>;
}

pub struct BlocketClient {
    client: Client,
    base_url: String,
    token: String,
}

impl BlocketClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MonitorError::ConfigError("BLOCKET_API_TOKEN is not set".to_string()))?;

        let client = Client::builder()
            .user_agent(concat!("bevakning-monitor/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!("API request failed [{}]: {}", status, text);
            return Err(MonitorError::InvalidResponse(format!("HTTP {}: {}", status, text)));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl MarketplaceApi for BlocketClient {
    async fn list_searches(&self) -> Result<Vec<SavedSearch>> {
        let url = format!("{}/saved/v2/searches", self.base_url);
        let body = self.get_json(&url, &[]).await?;
        let searches = parse_saved_searches(body)?;
        debug!("Fetched {} saved searches", searches.len());
        Ok(searches)
    }

    async fn fetch_listings(&self, search_id: &str, limit: u32) -> Result<Vec<Value>> {
        let url = format!("{}/saved/v2/searches_content/{}", self.base_url, search_id);
        let body = self.get_json(&url, &[("lim", limit.to_string())]).await?;
        Ok(parse_listings_page(body))
    }
}

/// Extract the saved searches from a `{"data": [...]}` response.
///
/// Entries that are not valid saved searches are skipped with a warning.
pub fn parse_saved_searches(body: Value) -> Result<Vec<SavedSearch>> {
    let Some(Value::Array(entries)) = body.get("data").cloned() else {
        return Err(MonitorError::InvalidResponse(
            "saved searches response has no `data` array".to_string(),
        ));
    };

    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<SavedSearch>(entry) {
            Ok(search) => Some(search),
            Err(e) => {
                warn!("Skipping malformed saved search: {}", e);
                None
            }
        })
        .collect())
}

/// Extract the listing records from a `{"data": [...]}` page; a page
/// without `data` holds no listings.
pub fn parse_listings_page(body: Value) -> Vec<Value> {
    match body {
        Value::Object(mut page) => match page.remove("data") {
            Some(Value::Array(listings)) => listings,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}
