use crate::model::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Url};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const ORDERS_PATH: &str = "wp-json/wc/v3/orders";
const PRODUCTS_PATH: &str = "wp-json/wc/v3/products/";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("storefront returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("storefront response is not a list of orders")]
    NotAList,
    #[error("storefront response is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Modified,
    Date,
}

impl SortKey {
    fn as_str(&self) -> &'static str {
        match self {
            SortKey::Modified => "modified",
            SortKey::Date => "date",
        }
    }
}

/// One page request against the order list endpoint. Results are always
/// sorted ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderQuery {
    pub page: u32,
    pub per_page: u32,
    pub modified_after: Option<DateTime<Utc>>,
    pub sort: SortKey,
}

#[async_trait]
pub trait OrderSource: Send + Sync {
    /// Raw order objects of one page. An empty list means there are no more pages.
    async fn fetch_page(&self, query: &OrderQuery) -> Result<Vec<Value>>;

    /// Best-effort total order count; `None` when the storefront does not say.
    async fn total_orders(&self) -> Result<Option<u64>>;
}

#[async_trait]
pub trait ImageLookup: Send + Sync {
    async fn product_image(&self, product_id: i64) -> Result<Option<String>>;
}

/// Builds the remote collaborators for one store.
pub trait SourceFactory: Send + Sync {
    fn orders(&self, store: &Store) -> Result<Arc<dyn OrderSource>>;

    fn images(&self, _store: &Store) -> Result<Option<Arc<dyn ImageLookup>>> {
        Ok(None)
    }
}

#[derive(Clone)]
pub struct WooClient {
    http: Client,
    base_url: Url,
    consumer_key: String,
    consumer_secret: String,
}

impl fmt::Debug for WooClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WooClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl WooClient {
    pub fn new(
        base_url: &str,
        consumer_key: &str,
        consumer_secret: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url.trim()).with_context(|| format!("invalid store URL {}", base_url))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent("order-watchbot/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            consumer_key: consumer_key.to_string(),
            consumer_secret: consumer_secret.to_string(),
        })
    }

    pub fn for_store(store: &Store, timeout: Duration) -> Result<Self> {
        Self::new(
            &store.base_url,
            &store.consumer_key,
            &store.consumer_secret,
            timeout,
        )
    }

    pub fn build_orders_request(&self, query: &OrderQuery) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(ORDERS_PATH)
            .context("invalid store base URL")?;
        let mut params: Vec<(&str, String)> = vec![
            ("page", query.page.to_string()),
            ("per_page", query.per_page.to_string()),
            ("orderby", query.sort.as_str().to_string()),
            ("order", "asc".to_string()),
            ("dates_are_gmt", "true".to_string()),
        ];
        if let Some(after) = query.modified_after {
            params.push((
                "modified_after",
                after.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        self.http
            .get(endpoint)
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret))
            .query(&params)
            .build()
            .context("failed to build orders request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        debug!(url = %request.url(), "storefront request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach storefront")?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(RemoteError::Status { status, body }.into());
        }
        Ok(res)
    }
}

#[async_trait]
impl OrderSource for WooClient {
    async fn fetch_page(&self, query: &OrderQuery) -> Result<Vec<Value>> {
        let request = self.build_orders_request(query)?;
        let res = self.execute(request).await?;
        let text = res.text().await.context("failed to read orders body")?;
        let body: Value = serde_json::from_str(&text).map_err(RemoteError::Decode)?;
        match body {
            Value::Array(orders) => Ok(orders),
            _ => Err(RemoteError::NotAList.into()),
        }
    }

    async fn total_orders(&self) -> Result<Option<u64>> {
        let count_query = OrderQuery {
            page: 1,
            per_page: 1,
            modified_after: None,
            sort: SortKey::Date,
        };
        let request = self.build_orders_request(&count_query)?;
        let res = self.execute(request).await?;
        Ok(res
            .headers()
            .get("X-WP-Total")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok()))
    }
}

#[async_trait]
impl ImageLookup for WooClient {
    async fn product_image(&self, product_id: i64) -> Result<Option<String>> {
        let endpoint = self
            .base_url
            .join(PRODUCTS_PATH)
            .and_then(|u| u.join(&product_id.to_string()))
            .context("invalid store base URL")?;
        let request = self
            .http
            .get(endpoint)
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret))
            .build()
            .context("failed to build product request")?;
        let res = self.execute(request).await?;
        let body: Value = res.json().await.context("invalid product response")?;
        Ok(body["images"][0]["src"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }
}

/// Production factory: one [`WooClient`] per store.
#[derive(Debug, Clone)]
pub struct WooSourceFactory {
    timeout: Duration,
}

impl WooSourceFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl SourceFactory for WooSourceFactory {
    fn orders(&self, store: &Store) -> Result<Arc<dyn OrderSource>> {
        Ok(Arc::new(WooClient::for_store(store, self.timeout)?))
    }

    fn images(&self, store: &Store) -> Result<Option<Arc<dyn ImageLookup>>> {
        Ok(Some(Arc::new(WooClient::for_store(store, self.timeout)?)))
    }
}
