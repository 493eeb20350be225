//! Single-payload entry point (webhook intake) into the delivery protocol.

use leadsync_core::{
    CrmRecordId, LeadPayload, LeadStatus, MappingState, NewLeadRequest, UpstreamId,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, info_span, Instrument};

use crate::delivery::{Delivery, DeliveryOutcome};
use crate::orchestrator::release_after_failed_insert;
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntakeOutcome {
    Accepted {
        request_id: i64,
        delivery: DeliveryOutcome,
    },
    /// The upstream id was already seen. `request_id` is set when a local row
    /// exists; `crm_record_id` when the lead is known to be created.
    Duplicate {
        upstream_id: UpstreamId,
        request_id: Option<i64>,
        crm_record_id: Option<CrmRecordId>,
    },
}

#[derive(Clone)]
pub struct LeadIntake {
    delivery: Delivery,
}

impl LeadIntake {
    pub fn new(delivery: Delivery) -> Self {
        Self { delivery }
    }

    /// Accepts a non-empty array whose first element is a lead payload, or a
    /// bare payload object. The stored payload keeps the submitted shape.
    pub async fn submit_payload(
        &self,
        raw: &str,
        source: &str,
    ) -> Result<IntakeOutcome, SyncError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| SyncError::InvalidPayload(format!("not JSON: {err}")))?;
        if matches!(&value, Value::Array(items) if items.is_empty()) {
            return Err(SyncError::InvalidPayload("empty payload array".into()));
        }
        let payload = LeadPayload::from_value(value.clone())
            .map_err(|err| SyncError::InvalidPayload(err.to_string()))?;
        let upstream_id = payload
            .upstream_id()
            .ok_or_else(|| SyncError::InvalidPayload("others.Lead.id is missing".into()))?;

        let span = info_span!("intake", upstream_id = upstream_id.get(), source);
        async {
            let requests = self.delivery.requests();
            let ledger = self.delivery.ledger();

            if let Some(existing) = requests.find_by_upstream_id(upstream_id).await? {
                info!(
                    request_id = existing.id,
                    status = %existing.status,
                    "duplicate lead request"
                );
                return Ok(duplicate_of_row(
                    upstream_id,
                    existing.id,
                    existing.status,
                    existing.crm_record_id,
                ));
            }
            if !ledger.reserve(upstream_id).await? {
                let crm_record_id = match ledger.state(upstream_id).await? {
                    Some(MappingState::Confirmed(id)) => Some(id),
                    _ => None,
                };
                info!("upstream id already reserved in entity mapping");
                return Ok(IntakeOutcome::Duplicate {
                    upstream_id,
                    request_id: None,
                    crm_record_id,
                });
            }

            let created = requests
                .create(NewLeadRequest {
                    upstream_id: Some(upstream_id),
                    payload: serde_json::to_string(&value)?,
                    status: LeadStatus::Processing,
                    source: source.to_string(),
                })
                .await;
            let row = match created {
                Ok(row) => row,
                Err(err) => {
                    release_after_failed_insert(ledger, upstream_id).await;
                    if err.is_conflict() {
                        if let Some(existing) = requests.find_by_upstream_id(upstream_id).await? {
                            return Ok(duplicate_of_row(
                                upstream_id,
                                existing.id,
                                existing.status,
                                existing.crm_record_id,
                            ));
                        }
                    }
                    return Err(err.into());
                }
            };
            info!(request_id = row.id, "lead request accepted");

            let delivery = self
                .delivery
                .deliver(row.id, Some(upstream_id), &payload, false)
                .await?;
            Ok(IntakeOutcome::Accepted {
                request_id: row.id,
                delivery,
            })
        }
        .instrument(span)
        .await
    }
}

fn duplicate_of_row(
    upstream_id: UpstreamId,
    request_id: i64,
    status: LeadStatus,
    crm_record_id: Option<CrmRecordId>,
) -> IntakeOutcome {
    IntakeOutcome::Duplicate {
        upstream_id,
        request_id: Some(request_id),
        crm_record_id: crm_record_id.filter(|_| status == LeadStatus::Processed),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use leadsync_core::{SOURCE_SYNC, SOURCE_WEBHOOK};
    use leadsync_storage::{LeadLedger, LeadRequestStore};

    use super::*;
    use crate::orchestrator::{CandidateOutcome, SkipReason};
    use crate::testing::{customer, Harness};

    #[tokio::test]
    async fn accepted_payload_is_delivered_and_stored_as_submitted() {
        let harness = Harness::new(Vec::new());
        let raw = harness.stored_payload(7);

        let outcome = harness.intake().submit_payload(&raw, SOURCE_WEBHOOK).await.unwrap();
        let IntakeOutcome::Accepted { request_id, delivery } = outcome else {
            panic!("expected acceptance, got {outcome:?}");
        };
        assert!(delivery.is_processed());

        let row = harness.requests.get(request_id).await.unwrap().unwrap();
        assert_eq!(row.source, SOURCE_WEBHOOK);
        assert_eq!(row.status, LeadStatus::Processed);
        assert_eq!(row.payload_json().unwrap(), serde_json::from_str::<Value>(&raw).unwrap());
        assert_eq!(
            harness.ledger.state(UpstreamId(7)).await.unwrap(),
            Some(MappingState::Confirmed(CrmRecordId::new("crm-1")))
        );
    }

    #[tokio::test]
    async fn bare_object_keeps_its_shape() {
        let harness = Harness::new(Vec::new());
        let raw = serde_json::to_string(&harness.payload(8)).unwrap();
        let outcome = harness.intake().submit_payload(&raw, SOURCE_WEBHOOK).await.unwrap();
        let IntakeOutcome::Accepted { request_id, .. } = outcome else {
            panic!("expected acceptance, got {outcome:?}");
        };
        let row = harness.requests.get(request_id).await.unwrap().unwrap();
        assert!(row.payload.starts_with('{'));
    }

    #[tokio::test]
    async fn untyped_form_fields_are_passed_to_the_creator() {
        let harness = Harness::new(Vec::new());
        let mut value = serde_json::to_value([harness.payload(12)]).unwrap();
        value[0]["vtiger"]["cf_1001"] = Value::from("Feira 2025");
        value[0]["others"]["origin"] = Value::from("landing-page");

        harness
            .intake()
            .submit_payload(&value.to_string(), SOURCE_WEBHOOK)
            .await
            .unwrap();
        let sent = harness.creator.payloads();
        assert_eq!(sent[0].vtiger.field("cf_1001"), Some("Feira 2025"));
        assert_eq!(sent[0].others.extra["origin"], "landing-page");
    }

    #[tokio::test]
    async fn resubmission_is_a_duplicate() {
        let harness = Harness::new(Vec::new());
        let raw = harness.stored_payload(7);
        let intake = harness.intake();
        intake.submit_payload(&raw, SOURCE_WEBHOOK).await.unwrap();

        let again = intake.submit_payload(&raw, SOURCE_WEBHOOK).await.unwrap();
        assert_eq!(
            again,
            IntakeOutcome::Duplicate {
                upstream_id: UpstreamId(7),
                request_id: Some(1),
                crm_record_id: Some(CrmRecordId::new("crm-1")),
            }
        );
        assert_eq!(harness.creator.calls(), 1);
    }

    #[tokio::test]
    async fn ledger_entry_without_local_row_is_a_duplicate() {
        let harness = Harness::new(Vec::new());
        harness
            .ledger
            .confirm(UpstreamId(9), &CrmRecordId::new("555"))
            .await
            .unwrap();
        let outcome = harness
            .intake()
            .submit_payload(&harness.stored_payload(9), SOURCE_WEBHOOK)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            IntakeOutcome::Duplicate {
                upstream_id: UpstreamId(9),
                request_id: None,
                crm_record_id: Some(CrmRecordId::new("555")),
            }
        );
        assert!(harness.requests.all().await.is_empty());
        assert_eq!(harness.creator.calls(), 0);
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected_before_any_write() {
        let harness = Harness::new(Vec::new());
        let no_id = serde_json::to_string(&[harness.payload(0)]).unwrap();
        for raw in ["not json", "[]", r#"[{"vtiger": {}}]"#, no_id.as_str()] {
            let err = harness
                .intake()
                .submit_payload(raw, SOURCE_WEBHOOK)
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::InvalidPayload(_)), "{raw}: {err}");
        }
        assert!(harness.requests.all().await.is_empty());
        assert!(harness.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn racing_sync_and_intake_create_one_lead() {
        let harness = Harness::new(vec![customer(1, "2025-12-10")]);
        harness.creator.set_delay(Duration::from_millis(20));
        let orchestrator = harness.orchestrator();
        let intake = harness.intake();
        let raw = harness.stored_payload(1);

        let (synced, submitted) = tokio::join!(
            orchestrator.sync("2025-12-10T15:00:00Z"),
            intake.submit_payload(&raw, SOURCE_WEBHOOK),
        );
        let synced = synced.unwrap();
        let submitted = submitted.unwrap();

        assert_eq!(harness.creator.calls(), 1);
        let rows = harness.requests.all().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, LeadStatus::Processed);
        assert!(matches!(
            harness.ledger.state(UpstreamId(1)).await.unwrap(),
            Some(MappingState::Confirmed(_))
        ));

        let sync_won = rows[0].source == SOURCE_SYNC;
        match (&synced.outcomes[0].outcome, &submitted) {
            (CandidateOutcome::Processed { .. }, IntakeOutcome::Duplicate { .. }) => {
                assert!(sync_won)
            }
            (CandidateOutcome::Skipped(reason), IntakeOutcome::Accepted { .. }) => {
                assert!(!sync_won);
                assert!(matches!(
                    reason,
                    SkipReason::ReservationLost
                        | SkipReason::AlreadyInLedger
                        | SkipReason::LocalRequestExists { .. }
                ));
            }
            other => panic!("both paths claimed the lead: {other:?}"),
        }
    }
}
