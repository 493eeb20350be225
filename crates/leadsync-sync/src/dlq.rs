//! Dead-letter queue: inspection, manual correction and reprocessing of
//! failed lead requests.

use std::time::Duration;

use chrono::Utc;
use leadsync_core::{
    CrmRecordId, EntityMapping, LeadPayload, LeadRequest, MappingState, UpstreamId,
};
use leadsync_storage::{ClaimOutcome, FailedLeadFilter};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, info_span, warn, Instrument};

use crate::dates::start_of_local_day;
use crate::delivery::{Delivery, DeliveryOutcome};
use crate::SyncError;

pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_STUCK_AFTER_MINUTES: i64 = 10;
pub const STUCK_RECOVERY_MESSAGE: &str = "Lead stuck in PROCESSING - auto-recovered";

const RESERVATION_LOST_MESSAGE: &str = "entity mapping reserved by another worker";
const CONTENDED_MESSAGE: &str = "lead was claimed concurrently, retry later";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReprocessOutcome {
    Processed { crm_record_id: CrmRecordId },
    /// The ledger already held a confirmed CRM id; the creator was not called.
    Reconciled { crm_record_id: CrmRecordId },
    Failed { error: String },
    AlreadyProcessed { crm_record_id: Option<CrmRecordId> },
    CurrentlyProcessing,
    /// The row stayed FAILED while other workers took it; it is left as is.
    Contended,
    ReservationLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailStatus {
    Success,
    Failed,
    Skipped,
}

impl ReprocessOutcome {
    fn detail_status(&self) -> DetailStatus {
        match self {
            Self::Processed { .. } | Self::Reconciled { .. } => DetailStatus::Success,
            Self::Failed { .. } => DetailStatus::Failed,
            Self::AlreadyProcessed { .. }
            | Self::CurrentlyProcessing
            | Self::Contended
            | Self::ReservationLost => DetailStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessDetail {
    pub id: i64,
    pub status: DetailStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crm_record_id: Option<CrmRecordId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReprocessStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub details: Vec<ReprocessDetail>,
}

impl ReprocessStats {
    fn record(&mut self, id: i64, result: Result<ReprocessOutcome, SyncError>) {
        let detail = match result {
            Ok(outcome) => {
                let status = outcome.detail_status();
                let (crm_record_id, error) = match outcome {
                    ReprocessOutcome::Processed { crm_record_id }
                    | ReprocessOutcome::Reconciled { crm_record_id } => (Some(crm_record_id), None),
                    ReprocessOutcome::AlreadyProcessed { crm_record_id } => {
                        (crm_record_id, Some("lead already processed".to_string()))
                    }
                    ReprocessOutcome::Failed { error } => (None, Some(error)),
                    ReprocessOutcome::CurrentlyProcessing => {
                        (None, Some("lead is currently being processed".to_string()))
                    }
                    ReprocessOutcome::Contended => (None, Some(CONTENDED_MESSAGE.to_string())),
                    ReprocessOutcome::ReservationLost => {
                        (None, Some(RESERVATION_LOST_MESSAGE.to_string()))
                    }
                };
                ReprocessDetail {
                    id,
                    status,
                    crm_record_id,
                    error,
                }
            }
            Err(err) => ReprocessDetail {
                id,
                status: DetailStatus::Failed,
                crm_record_id: None,
                error: Some(err.to_string()),
            },
        };
        match detail.status {
            DetailStatus::Success => self.success += 1,
            DetailStatus::Failed => self.failed += 1,
            DetailStatus::Skipped => self.skipped += 1,
        }
        self.details.push(detail);
    }
}

/// A FAILED row with the company name pulled out of its payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedLead {
    #[serde(flatten)]
    pub request: LeadRequest,
    pub company: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TodayStats {
    pub failed: i64,
    pub processed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadStats {
    pub total: i64,
    pub failed: i64,
    pub processed: i64,
    pub processing: i64,
    pub today: TodayStats,
    pub success_rate: String,
}

/// `processed / total` as a percentage with two decimals, `0%` when empty.
pub fn success_rate(processed: i64, total: i64) -> String {
    if total > 0 {
        format!("{:.2}%", processed as f64 / total as f64 * 100.0)
    } else {
        "0%".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadDiff {
    pub current: Value,
    pub original: Option<Value>,
    pub has_changes: bool,
}

/// Shallow merge of `patch` into one stored payload element. A patch naming
/// `vtiger` or `others` is merged section by section; anything else is a
/// field map for `vtiger`.
pub fn merge_payload_patch(data: &mut Value, patch: &Value) -> Result<(), SyncError> {
    let Value::Object(patch) = patch else {
        return Err(SyncError::InvalidPayload("patch must be a JSON object".into()));
    };
    let Value::Object(data) = data else {
        return Err(SyncError::InvalidPayload("stored payload is not an object".into()));
    };

    if patch.contains_key("vtiger") || patch.contains_key("others") {
        for section in ["vtiger", "others"] {
            match patch.get(section) {
                None => {}
                Some(Value::Object(fields)) => merge_section(data, section, fields),
                Some(_) => {
                    return Err(SyncError::InvalidPayload(format!(
                        "patch section `{section}` must be an object"
                    )))
                }
            }
        }
    } else {
        merge_section(data, "vtiger", patch);
    }
    Ok(())
}

fn merge_section(data: &mut Map<String, Value>, section: &str, fields: &Map<String, Value>) {
    let target = data
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Clone)]
pub struct DeadLetterService {
    delivery: Delivery,
    batch_delay: Duration,
    stuck_after: chrono::Duration,
}

impl DeadLetterService {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            batch_delay: DEFAULT_BATCH_DELAY,
            stuck_after: chrono::Duration::minutes(DEFAULT_STUCK_AFTER_MINUTES),
        }
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_stuck_after(mut self, stuck_after: chrono::Duration) -> Self {
        self.stuck_after = stuck_after;
        self
    }

    /// Retries one request. Every attempt that reaches the creator bumps
    /// `retry_count`, success or not.
    pub async fn reprocess_one(&self, id: i64) -> Result<ReprocessOutcome, SyncError> {
        let span = info_span!("reprocess", request_id = id);
        async {
            let row = match self.delivery.requests().claim_for_retry(id).await? {
                ClaimOutcome::NotFound => return Err(SyncError::NotFound(id)),
                ClaimOutcome::AlreadyProcessed(row) => {
                    info!("lead already processed");
                    return Ok(ReprocessOutcome::AlreadyProcessed {
                        crm_record_id: row.crm_record_id,
                    });
                }
                ClaimOutcome::InProgress(_) => {
                    info!("lead is currently being processed");
                    return Ok(ReprocessOutcome::CurrentlyProcessing);
                }
                ClaimOutcome::Contended(_) => {
                    warn!("lead claim kept losing to other workers");
                    return Ok(ReprocessOutcome::Contended);
                }
                ClaimOutcome::Claimed(row) => row,
            };
            info!(attempt = row.retry_count + 1, "reprocessing lead");

            let payload = match LeadPayload::from_stored(&row.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    let error = format!("stored payload is not a lead payload: {err}");
                    self.delivery
                        .requests()
                        .record_failure(id, &error, true)
                        .await?;
                    return Ok(ReprocessOutcome::Failed { error });
                }
            };
            let upstream_id = row.upstream_id.or_else(|| payload.upstream_id());

            if let Some(upstream_id) = upstream_id {
                match self.prepare_ledger(id, upstream_id).await {
                    Ok(None) => {}
                    Ok(Some(outcome)) => return Ok(outcome),
                    Err(err) => {
                        let error = format!("entity mapping unavailable: {err}");
                        self.delivery
                            .requests()
                            .record_failure(id, &error, false)
                            .await?;
                        return Ok(ReprocessOutcome::Failed { error });
                    }
                }
            }

            Ok(
                match self.delivery.deliver(id, upstream_id, &payload, true).await? {
                    DeliveryOutcome::Processed { crm_record_id } => {
                        ReprocessOutcome::Processed { crm_record_id }
                    }
                    DeliveryOutcome::Failed { error } => ReprocessOutcome::Failed { error },
                },
            )
        }
        .instrument(span)
        .await
    }

    /// Makes sure the ledger holds a reservation for a claimed row before the
    /// creator runs. Returns an outcome when the attempt must stop here.
    async fn prepare_ledger(
        &self,
        id: i64,
        upstream_id: UpstreamId,
    ) -> Result<Option<ReprocessOutcome>, SyncError> {
        let ledger = self.delivery.ledger();
        match ledger.state(upstream_id).await? {
            Some(MappingState::Confirmed(crm_record_id)) => {
                info!(
                    crm_record_id = %crm_record_id,
                    "crm lead already exists, reconciling local row"
                );
                self.delivery
                    .requests()
                    .record_success(id, &crm_record_id, true)
                    .await?;
                Ok(Some(ReprocessOutcome::Reconciled { crm_record_id }))
            }
            Some(MappingState::Reserved) | Some(MappingState::Failed) => Ok(None),
            None => {
                if ledger.reserve(upstream_id).await? {
                    return Ok(None);
                }
                warn!("could not re-reserve released entity mapping");
                self.delivery
                    .requests()
                    .record_failure(id, RESERVATION_LOST_MESSAGE, true)
                    .await?;
                Ok(Some(ReprocessOutcome::ReservationLost))
            }
        }
    }

    /// Sequential, with a short pause between items. One item's error never
    /// stops the batch.
    pub async fn reprocess_batch(&self, ids: &[i64]) -> ReprocessStats {
        let mut stats = ReprocessStats {
            total: ids.len(),
            ..Default::default()
        };
        info!(total = ids.len(), "starting batch reprocess");
        for (index, &id) in ids.iter().enumerate() {
            let result = self.reprocess_one(id).await;
            stats.record(id, result);
            if index + 1 < ids.len() && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }
        info!(
            total = stats.total,
            success = stats.success,
            failed = stats.failed,
            skipped = stats.skipped,
            "batch reprocess completed"
        );
        stats
    }

    /// FAILED rows whose `retry_count` is still below `max_retries`.
    pub async fn reprocess_all_failed(
        &self,
        max_retries: i32,
    ) -> Result<ReprocessStats, SyncError> {
        let ids = self
            .delivery
            .requests()
            .failed_ids_below_retry_cap(max_retries)
            .await?;
        if ids.is_empty() {
            info!(max_retries, "no failed leads to reprocess");
            return Ok(ReprocessStats::default());
        }
        info!(count = ids.len(), max_retries, "reprocessing failed leads");
        Ok(self.reprocess_batch(&ids).await)
    }

    /// Merges `patch` into the stored payload, keeping its array or object
    /// shape. The pre-edit payload is snapshotted on the first edit only. A
    /// patch that leaves the payload unreadable as a lead is rejected and
    /// nothing is written.
    pub async fn edit_payload(&self, id: i64, patch: &Value) -> Result<LeadRequest, SyncError> {
        let requests = self.delivery.requests();
        let row = requests.get(id).await?.ok_or(SyncError::NotFound(id))?;

        let stored: Value = serde_json::from_str(&row.payload)?;
        let updated = match stored {
            Value::Array(items) => {
                let mut items = items.into_iter();
                let mut first = items.next().ok_or_else(|| {
                    SyncError::InvalidPayload("stored payload array is empty".into())
                })?;
                merge_payload_patch(&mut first, patch)?;
                Value::Array(vec![first])
            }
            mut object => {
                merge_payload_patch(&mut object, patch)?;
                object
            }
        };
        // Stored payloads must stay readable as a lead.
        LeadPayload::from_value(updated.clone()).map_err(|err| {
            SyncError::InvalidPayload(format!("edited payload is not a lead payload: {err}"))
        })?;

        let row = requests
            .update_payload(id, serde_json::to_string(&updated)?)
            .await?;
        info!(request_id = id, "lead payload edited");
        Ok(row)
    }

    pub async fn failed_leads(
        &self,
        filter: &FailedLeadFilter,
    ) -> Result<Vec<FailedLead>, SyncError> {
        let rows = self.delivery.requests().list_failed(filter).await?;
        Ok(rows
            .into_iter()
            .map(|request| {
                let company = LeadPayload::from_stored(&request.payload)
                    .ok()
                    .map(|p| p.vtiger.company);
                FailedLead { request, company }
            })
            .collect())
    }

    /// Ledger rows still reserved or failed, oldest first. These are the
    /// customers no path will pick up again without an operator.
    pub async fn unconfirmed_mappings(&self) -> Result<Vec<EntityMapping>, SyncError> {
        Ok(self.delivery.ledger().list_unconfirmed().await?)
    }

    pub async fn stats(&self) -> Result<LeadStats, SyncError> {
        let since = start_of_local_day(Utc::now());
        let counts = self.delivery.requests().stats(since).await?;
        Ok(LeadStats {
            total: counts.total,
            failed: counts.failed,
            processed: counts.processed,
            processing: counts.processing,
            today: TodayStats {
                failed: counts.failed_since,
                processed: counts.processed_since,
            },
            success_rate: success_rate(counts.processed, counts.total),
        })
    }

    pub async fn payload_diff(&self, id: i64) -> Result<PayloadDiff, SyncError> {
        let row = self
            .delivery
            .requests()
            .get(id)
            .await?
            .ok_or(SyncError::NotFound(id))?;
        let current = row.payload_json()?;
        let original = row.original_payload_json()?;
        let has_changes = original.as_ref().is_some_and(|o| *o != current);
        Ok(PayloadDiff {
            current,
            original,
            has_changes,
        })
    }

    /// Moves PROCESSING rows untouched for longer than the staleness window
    /// back to FAILED so the sweep can pick them up.
    pub async fn recover_stuck(&self) -> Result<u64, SyncError> {
        let cutoff = Utc::now() - self.stuck_after;
        let moved = self
            .delivery
            .requests()
            .fail_stale_processing(cutoff, STUCK_RECOVERY_MESSAGE)
            .await?;
        if moved > 0 {
            warn!(moved, "recovered leads stuck in processing");
        }
        Ok(moved)
    }
}
