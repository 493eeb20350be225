//! Failure notification sinks.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::http::HttpClientConfig;

pub const SUBJECT_PREFIX: &str = "[Auvo-CRM Error]";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification webhook failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notification webhook returned status {0}")]
    Status(u16),
}

/// One failed lead creation, with everything an operator needs to retry it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureNotice {
    pub subject: String,
    pub error: String,
    pub request_id: i64,
    pub upstream_id: Option<i64>,
    pub retry_url: String,
    pub retry_command: String,
    pub context: serde_json::Value,
}

impl FailureNotice {
    pub fn new(
        api_base_url: &str,
        request_id: i64,
        upstream_id: Option<i64>,
        error: &str,
        context: serde_json::Value,
    ) -> Self {
        let retry_url = format!(
            "{}/webhook/lead/{request_id}/retry",
            api_base_url.trim_end_matches('/')
        );
        let subject = match upstream_id {
            Some(id) => format!("{SUBJECT_PREFIX} Lead Auvo {id} Failed"),
            None => format!("{SUBJECT_PREFIX} Lead request {request_id} Failed"),
        };
        Self {
            subject,
            error: error.lines().next().unwrap_or_default().to_string(),
            request_id,
            upstream_id,
            retry_command: format!("curl -X POST \"{retry_url}\""),
            retry_url,
            context,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notice: &FailureNotice) -> Result<(), NotifyError>;
}

/// Writes the notice to the log at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        error!(
            subject = %notice.subject,
            error = %notice.error,
            request_id = notice.request_id,
            upstream_id = ?notice.upstream_id,
            retry = %notice.retry_command,
            "lead creation failed"
        );
        Ok(())
    }
}

/// Relays the notice as JSON to an alerting endpoint (chat webhook, mail
/// relay, and similar).
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, http: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            url: url.into(),
            http: http.build_client()?,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        let resp = self.http.post(&self.url).json(notice).send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::sync::Mutex;

    use super::*;

    #[test]
    fn notice_carries_retry_url_and_command() {
        let notice = FailureNotice::new(
            "http://localhost:3000/",
            42,
            Some(991),
            "Timeout 30000ms exceeded\n    at page.waitForURL",
            serde_json::json!({ "requestId": 42 }),
        );
        assert_eq!(notice.subject, "[Auvo-CRM Error] Lead Auvo 991 Failed");
        assert_eq!(notice.error, "Timeout 30000ms exceeded");
        assert_eq!(notice.retry_url, "http://localhost:3000/webhook/lead/42/retry");
        assert_eq!(
            notice.retry_command,
            "curl -X POST \"http://localhost:3000/webhook/lead/42/retry\""
        );
    }

    #[tokio::test]
    async fn webhook_notifier_posts_the_notice() {
        let received = Arc::new(Mutex::new(Vec::<serde_json::Value>::new()));
        let app = Router::new()
            .route(
                "/alerts",
                post(
                    |State(sink): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                     Json(body): Json<serde_json::Value>| async move {
                        sink.lock().await.push(body);
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let notifier =
            WebhookNotifier::new(format!("http://{addr}/alerts"), &HttpClientConfig::default())
                .unwrap();
        let notice = FailureNotice::new("http://api", 7, None, "boom", serde_json::Value::Null);
        notifier.send(&notice).await.unwrap();

        let bodies = received.lock().await;
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["request_id"], 7);
        assert_eq!(bodies[0]["subject"], "[Auvo-CRM Error] Lead request 7 Failed");
    }
}
