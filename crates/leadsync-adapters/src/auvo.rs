//! Auvo REST client.
//!
//! Every list call resolves to an [`ApiEnvelope`]. Transport errors and non-2xx
//! responses become `success: false` with an empty entity list, so callers
//! branch on the envelope rather than on `Result`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use leadsync_core::{ApiEnvelope, ApiResult, Customer, DateRange, Task, User};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::http::HttpClientConfig;

pub const DEFAULT_AUVO_API_URL: &str = "https://api.auvo.com.br/v2";
pub const CUSTOMER_PAGE_SIZE: i64 = 1000;
pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// Auvo tokens live for an hour; refresh with a five minute margin.
const TOKEN_TTL: Duration = Duration::from_secs(55 * 60);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("auvo login rejected with status {0}")]
    LoginRejected(u16),
    #[error("auvo login response has no accessToken")]
    MissingToken,
    #[error("auvo {entity} request returned status {status}")]
    Status { entity: &'static str, status: u16 },
    #[error("auvo request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl UpstreamError {
    fn status_code(&self) -> u16 {
        match self {
            Self::Status { status, .. } => *status,
            _ => 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl CustomerFilter {
    pub fn created_on(date: impl Into<String>) -> Self {
        Self {
            creation_date: Some(date.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskFilter<'a> {
    customer_id: i64,
    start_date: &'a str,
    end_date: &'a str,
}

#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn get_customers(&self, filter: &CustomerFilter, page_size: i64)
        -> ApiEnvelope<Customer>;

    async fn get_customer_by_id(&self, customer_id: i64) -> Option<Customer>;

    async fn get_tasks_by_customer(&self, customer_id: i64, range: &DateRange)
        -> ApiEnvelope<Task>;

    /// Exact-name lookup; first match wins.
    async fn get_user_by_name(&self, name: &str) -> Option<User>;

    async fn get_user_by_id(&self, user_id: i64) -> Option<User>;
}

#[derive(Debug, Clone)]
pub struct AuvoConfig {
    pub api_url: String,
    pub api_key: String,
    pub api_token: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    result: Option<LoginResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResult {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct ListResponse<T> {
    result: Option<ApiResult<T>>,
}

#[derive(Debug)]
pub struct AuvoClient {
    config: AuvoConfig,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl AuvoClient {
    pub fn new(config: AuvoConfig, http: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            http: http.build_client()?,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self, force_refresh: bool) -> Result<String, UpstreamError> {
        let mut cached = self.token.lock().await;
        if !force_refresh {
            if let Some(token) = cached.as_ref() {
                if Instant::now() < token.expires_at {
                    return Ok(token.access_token.clone());
                }
            }
        }

        info!("requesting auvo access token");
        let resp = self
            .http
            .post(self.url("login"))
            .json(&serde_json::json!({
                "apiKey": self.config.api_key,
                "apiToken": self.config.api_token,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            *cached = None;
            return Err(UpstreamError::LoginRejected(resp.status().as_u16()));
        }
        let body: LoginResponse = resp.json().await?;
        let access_token = body
            .result
            .and_then(|r| r.access_token)
            .filter(|t| !t.is_empty())
            .ok_or(UpstreamError::MissingToken)?;
        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + TOKEN_TTL,
        });
        Ok(access_token)
    }

    async fn fetch_page<T: DeserializeOwned>(
        &self,
        entity: &'static str,
        filter: Option<&serde_json::Value>,
        page: i64,
        page_size: i64,
    ) -> Result<(u16, ApiResult<T>), UpstreamError> {
        let mut query = Vec::with_capacity(4);
        if let Some(filter) = filter {
            query.push(("ParamFilter", filter.to_string()));
        }
        query.push(("Page", page.to_string()));
        query.push(("PageSize", page_size.to_string()));
        query.push(("Order", "Asc".to_string()));

        let mut reauthenticated = false;
        loop {
            let token = self.access_token(reauthenticated).await?;
            let resp = self
                .http
                .get(self.url(entity))
                .bearer_auth(&token)
                .query(&query)
                .send()
                .await?;
            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                warn!(entity, "auvo token rejected; re-authenticating once");
                reauthenticated = true;
                continue;
            }
            if !status.is_success() {
                return Err(UpstreamError::Status {
                    entity,
                    status: status.as_u16(),
                });
            }
            let body: ListResponse<T> = resp.json().await?;
            let result = body
                .result
                .unwrap_or_else(|| ApiResult::empty(page, page_size));
            return Ok((status.as_u16(), result));
        }
    }

    async fn list<T: DeserializeOwned>(
        &self,
        entity: &'static str,
        filter: Option<serde_json::Value>,
        page: i64,
        page_size: i64,
    ) -> ApiEnvelope<T> {
        let span = info_span!("auvo_get", entity, page, page_size);
        async {
            match self.fetch_page(entity, filter.as_ref(), page, page_size).await {
                Ok((status, result)) => {
                    info!(
                        entities = result.entity_list.len(),
                        total_items = result.paged_search_return_data.total_items,
                        "auvo response"
                    );
                    ApiEnvelope::ok(status, result)
                }
                Err(err) => {
                    warn!(error = %err, filter = ?filter, "auvo request failed");
                    ApiEnvelope::failed(err.status_code(), page, page_size)
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl UpstreamApi for AuvoClient {
    async fn get_customers(
        &self,
        filter: &CustomerFilter,
        page_size: i64,
    ) -> ApiEnvelope<Customer> {
        let filter = serde_json::to_value(filter).ok();
        self.list("customers", filter, 1, page_size).await
    }

    async fn get_customer_by_id(&self, customer_id: i64) -> Option<Customer> {
        self.list("customers", Some(serde_json::json!({ "id": customer_id })), 1, 1)
            .await
            .into_first()
    }

    async fn get_tasks_by_customer(
        &self,
        customer_id: i64,
        range: &DateRange,
    ) -> ApiEnvelope<Task> {
        let filter = serde_json::to_value(TaskFilter {
            customer_id,
            start_date: &range.date_start,
            end_date: &range.date_end,
        })
        .ok();
        self.list("tasks", filter, 1, DEFAULT_PAGE_SIZE).await
    }

    async fn get_user_by_name(&self, name: &str) -> Option<User> {
        self.list("users", Some(serde_json::json!({ "name": name })), 1, DEFAULT_PAGE_SIZE)
            .await
            .into_first()
    }

    async fn get_user_by_id(&self, user_id: i64) -> Option<User> {
        self.list("users", Some(serde_json::json!({ "userID": user_id })), 1, DEFAULT_PAGE_SIZE)
            .await
            .into_first()
    }
}
