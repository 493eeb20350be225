//! CRM Lead Creator collaborator.
//!
//! Creation is not idempotent: a call that times out may still have created
//! the lead. Callers must never retry it blindly; the ledger decides.

use std::time::Duration;

use async_trait::async_trait;
use leadsync_core::{CrmRecordId, LeadPayload};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

use crate::http::HttpClientConfig;

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("lead creation timed out after {0:?}")]
    Timeout(Duration),
    #[error("lead creator rejected the payload ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("lead creator unreachable: {0}")]
    Transport(String),
    #[error("lead creator response had no record id")]
    MissingRecordId,
}

#[async_trait]
pub trait LeadCreator: Send + Sync {
    async fn create(&self, payload: &LeadPayload) -> Result<CrmRecordId, AutomationError>;
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(alias = "crmRecordId", alias = "recordId", alias = "vtigerId", alias = "id")]
    record_id: Option<serde_json::Value>,
}

fn record_id_text(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Posts the payload to an automation service that fills the CRM form and
/// answers with the new record id.
#[derive(Debug, Clone)]
pub struct HttpLeadCreator {
    endpoint: String,
    auth_token: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpLeadCreator {
    pub fn new(
        endpoint: impl Into<String>,
        auth_token: Option<String>,
        http: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: endpoint.into(),
            auth_token,
            timeout: http.timeout,
            http: http.build_client()?,
        })
    }
}

#[async_trait]
impl LeadCreator for HttpLeadCreator {
    async fn create(&self, payload: &LeadPayload) -> Result<CrmRecordId, AutomationError> {
        let upstream_id = payload.others.lead.id;
        let span = info_span!("crm_create", upstream_id);
        async {
            let mut request = self.http.post(&self.endpoint).json(payload);
            if let Some(token) = &self.auth_token {
                request = request.bearer_auth(token);
            }
            let resp = request.send().await.map_err(|err| {
                if err.is_timeout() {
                    AutomationError::Timeout(self.timeout)
                } else {
                    AutomationError::Transport(err.to_string())
                }
            })?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                let message = body.lines().next().unwrap_or_default().trim().to_string();
                return Err(AutomationError::Rejected {
                    status: status.as_u16(),
                    message,
                });
            }

            let body: CreateResponse = resp
                .json()
                .await
                .map_err(|err| AutomationError::Transport(err.to_string()))?;
            let record_id = body
                .record_id
                .and_then(record_id_text)
                .ok_or(AutomationError::MissingRecordId)?;
            info!(crm_record_id = %record_id, "crm lead created");
            Ok(CrmRecordId::new(record_id))
        }
        .instrument(span)
        .await
    }
}
