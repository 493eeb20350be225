//! The create-then-record step shared by sync, intake and reprocessing.
//!
//! Preconditions: the local row is PROCESSING and, when there is an upstream
//! id, the ledger holds a reservation for it. The creator is called exactly
//! once; both stores are then updated whatever the outcome.

use std::sync::Arc;

use leadsync_adapters::{FailureNotice, LeadCreator, Notifier};
use leadsync_core::{CrmRecordId, LeadPayload, UpstreamId};
use leadsync_storage::{LeadLedger, LeadRequestStore};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Processed { crm_record_id: CrmRecordId },
    Failed { error: String },
}

impl DeliveryOutcome {
    pub fn is_processed(&self) -> bool {
        matches!(self, Self::Processed { .. })
    }
}

#[derive(Clone)]
pub struct Delivery {
    creator: Arc<dyn LeadCreator>,
    ledger: Arc<dyn LeadLedger>,
    requests: Arc<dyn LeadRequestStore>,
    notifier: Arc<dyn Notifier>,
    api_base_url: String,
}

impl Delivery {
    pub fn new(
        creator: Arc<dyn LeadCreator>,
        ledger: Arc<dyn LeadLedger>,
        requests: Arc<dyn LeadRequestStore>,
        notifier: Arc<dyn Notifier>,
        api_base_url: impl Into<String>,
    ) -> Self {
        Self {
            creator,
            ledger,
            requests,
            notifier,
            api_base_url: api_base_url.into(),
        }
    }

    pub fn ledger(&self) -> &dyn LeadLedger {
        self.ledger.as_ref()
    }

    pub fn requests(&self) -> &dyn LeadRequestStore {
        self.requests.as_ref()
    }

    /// Invokes the creator and records the result. `count_retry` is set on
    /// reprocessing attempts only.
    ///
    /// A ledger write failure is logged and does not change the outcome; a
    /// local write failure is returned after the ledger has been updated.
    pub async fn deliver(
        &self,
        request_id: i64,
        upstream_id: Option<UpstreamId>,
        payload: &LeadPayload,
        count_retry: bool,
    ) -> Result<DeliveryOutcome, SyncError> {
        match self.creator.create(payload).await {
            Ok(crm_record_id) => {
                let local = self
                    .requests
                    .record_success(request_id, &crm_record_id, count_retry)
                    .await;
                if let Some(id) = upstream_id {
                    if let Err(err) = self.ledger.confirm(id, &crm_record_id).await {
                        error!(
                            upstream_id = %id,
                            crm_record_id = %crm_record_id,
                            error = %err,
                            "ledger confirm failed; mapping stays reserved"
                        );
                    }
                }
                local?;
                info!(
                    request_id,
                    upstream_id = ?upstream_id.map(UpstreamId::get),
                    crm_record_id = %crm_record_id,
                    "lead created"
                );
                Ok(DeliveryOutcome::Processed { crm_record_id })
            }
            Err(err) => {
                let message = err.to_string();
                error!(
                    request_id,
                    upstream_id = ?upstream_id.map(UpstreamId::get),
                    error = %message,
                    "lead creation failed"
                );
                let local = self
                    .requests
                    .record_failure(request_id, &message, count_retry)
                    .await;
                if let Some(id) = upstream_id {
                    if let Err(err) = self.ledger.mark_failed(id).await {
                        error!(upstream_id = %id, error = %err, "ledger mark_failed failed");
                    }
                }
                self.notify_failure(request_id, upstream_id, &message, payload)
                    .await;
                local?;
                Ok(DeliveryOutcome::Failed { error: message })
            }
        }
    }

    /// Best effort: a notifier error is logged and swallowed.
    pub async fn notify_failure(
        &self,
        request_id: i64,
        upstream_id: Option<UpstreamId>,
        error: &str,
        payload: &LeadPayload,
    ) {
        let context = json!({
            "requestId": request_id,
            "upstreamId": upstream_id,
            "company": payload.vtiger.company,
            "payload": payload,
        });
        let notice = FailureNotice::new(
            &self.api_base_url,
            request_id,
            upstream_id.map(UpstreamId::get),
            error,
            context,
        );
        if let Err(err) = self.notifier.send(&notice).await {
            warn!(request_id, error = %err, "failure notification not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use leadsync_adapters::NotifyError;
    use leadsync_core::{EntityMapping, LeadStatus, MappingState, NewLeadRequest, SOURCE_WEBHOOK};
    use leadsync_storage::{MemoryLeadRequestStore, StoreError, StoreResult};

    use super::*;
    use crate::testing::Harness;

    struct BrokenLedger;

    #[async_trait]
    impl LeadLedger for BrokenLedger {
        async fn exists(&self, _: UpstreamId) -> StoreResult<bool> {
            Err(StoreError::Corrupt("ledger offline".into()))
        }
        async fn state(&self, _: UpstreamId) -> StoreResult<Option<MappingState>> {
            Err(StoreError::Corrupt("ledger offline".into()))
        }
        async fn reserve(&self, _: UpstreamId) -> StoreResult<bool> {
            Err(StoreError::Corrupt("ledger offline".into()))
        }
        async fn confirm(&self, _: UpstreamId, _: &CrmRecordId) -> StoreResult<()> {
            Err(StoreError::Corrupt("ledger offline".into()))
        }
        async fn mark_failed(&self, _: UpstreamId) -> StoreResult<()> {
            Err(StoreError::Corrupt("ledger offline".into()))
        }
        async fn release(&self, _: UpstreamId) -> StoreResult<bool> {
            Err(StoreError::Corrupt("ledger offline".into()))
        }
        async fn list_unconfirmed(&self) -> StoreResult<Vec<EntityMapping>> {
            Err(StoreError::Corrupt("ledger offline".into()))
        }
    }

    struct DownNotifier;

    #[async_trait]
    impl Notifier for DownNotifier {
        async fn send(&self, _: &FailureNotice) -> Result<(), NotifyError> {
            Err(NotifyError::Status(503))
        }
    }

    async fn processing_row(requests: &MemoryLeadRequestStore, payload: String) -> i64 {
        requests
            .create(NewLeadRequest {
                upstream_id: Some(UpstreamId(21)),
                payload,
                status: LeadStatus::Processing,
                source: SOURCE_WEBHOOK.into(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn ledger_write_failures_do_not_change_the_outcome() {
        let harness = Harness::new(Vec::new());
        let requests = Arc::new(MemoryLeadRequestStore::new());
        let id = processing_row(&requests, harness.stored_payload(21)).await;
        let delivery = Delivery::new(
            harness.creator.clone(),
            Arc::new(BrokenLedger),
            requests.clone(),
            harness.notifier.clone(),
            "http://localhost:3000",
        );

        let outcome = delivery
            .deliver(id, Some(UpstreamId(21)), &harness.payload(21), false)
            .await
            .unwrap();
        assert!(outcome.is_processed());
        let row = requests.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, LeadStatus::Processed);
        assert_eq!(row.crm_record_id, Some(CrmRecordId::new("crm-1")));
    }

    #[tokio::test]
    async fn unreachable_notifier_is_swallowed() {
        let harness = Harness::new(Vec::new());
        harness.creator.fail_next("form rejected");
        let requests = Arc::new(MemoryLeadRequestStore::new());
        let id = processing_row(&requests, harness.stored_payload(21)).await;
        let delivery = Delivery::new(
            harness.creator.clone(),
            harness.ledger.clone(),
            requests.clone(),
            Arc::new(DownNotifier),
            "http://localhost:3000",
        );

        let outcome = delivery
            .deliver(id, Some(UpstreamId(21)), &harness.payload(21), true)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Failed {
                error: "lead creator unreachable: form rejected".into()
            }
        );
        let row = requests.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, LeadStatus::Failed);
        assert_eq!(row.retry_count, 1);
    }
}
