//! Scheduled pull of new Auvo customers into the CRM.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use leadsync_adapters::{CustomerFilter, UpstreamApi, CUSTOMER_PAGE_SIZE};
use leadsync_core::{
    CrmRecordId, Customer, DateRange, LeadStatus, NewLeadRequest, UpstreamId, SOURCE_SYNC,
};
use leadsync_storage::LeadLedger;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::FilterConfig;
use crate::dates::resolve_date_range;
use crate::delivery::{Delivery, DeliveryOutcome};
use crate::payload::PayloadBuilder;
use crate::SyncError;

pub const DEFAULT_CANDIDATE_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyInLedger,
    LocalRequestExists { request_id: i64, status: LeadStatus },
    NoTask,
    UserNotFound { name: String },
    NotQualifyingRole { job_position: String },
    NotInPilot { user_id: i64 },
    ReservationLost,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInLedger => f.write_str("already in entity mapping"),
            Self::LocalRequestExists { request_id, status } => {
                write!(f, "already has lead request #{request_id} ({status})")
            }
            Self::NoTask => f.write_str("no tasks found"),
            Self::UserNotFound { name } => write!(f, "user not found: {name}"),
            Self::NotQualifyingRole { job_position } => {
                write!(f, "user job position is {job_position:?}")
            }
            Self::NotInPilot { user_id } => write!(f, "user {user_id} not in pilot list"),
            Self::ReservationLost => f.write_str("already reserved in entity mapping"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CandidateOutcome {
    Processed { crm_record_id: CrmRecordId },
    Skipped(SkipReason),
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateResult {
    pub upstream_id: UpstreamId,
    pub request_id: Option<i64>,
    #[serde(flatten)]
    pub outcome: CandidateOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub run_id: Uuid,
    pub timestamp: String,
    pub date_range: DateRange,
    pub total_candidates: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub outcomes: Vec<CandidateResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    /// Set when the customer list could not be fetched.
    pub aborted: Option<String>,
}

impl SyncResult {
    fn new(timestamp: &str, date_range: DateRange) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            timestamp: timestamp.to_string(),
            date_range,
            total_candidates: 0,
            processed: 0,
            skipped: 0,
            errors: 0,
            outcomes: Vec::new(),
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            aborted: None,
        }
    }

    fn push(&mut self, result: CandidateResult) {
        match result.outcome {
            CandidateOutcome::Processed { .. } => self.processed += 1,
            CandidateOutcome::Skipped(_) => self.skipped += 1,
            CandidateOutcome::Failed { .. } => self.errors += 1,
        }
        self.outcomes.push(result);
    }

    fn finish(mut self) -> Self {
        self.completed_at = Utc::now();
        self.duration_ms = (self.completed_at - self.started_at).num_milliseconds();
        self
    }
}

pub struct SyncOrchestrator {
    upstream: Arc<dyn UpstreamApi>,
    builder: Arc<PayloadBuilder>,
    delivery: Delivery,
    filters: FilterConfig,
    candidate_delay: Duration,
}

impl SyncOrchestrator {
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        builder: Arc<PayloadBuilder>,
        delivery: Delivery,
        filters: FilterConfig,
    ) -> Self {
        Self {
            upstream,
            builder,
            delivery,
            filters,
            candidate_delay: DEFAULT_CANDIDATE_DELAY,
        }
    }

    pub fn with_candidate_delay(mut self, delay: Duration) -> Self {
        self.candidate_delay = delay;
        self
    }

    /// One sync run for the local day of `timestamp`. Candidates are handled
    /// one at a time; only an invalid timestamp fails the call.
    pub async fn sync(&self, timestamp: &str) -> Result<SyncResult, SyncError> {
        let date_range = resolve_date_range(timestamp)?;
        let mut result = SyncResult::new(timestamp, date_range.clone());
        let span = info_span!(
            "sync_run",
            run_id = %result.run_id,
            date_start = %date_range.date_start,
            date_end = %date_range.date_end
        );

        let result = async {
            info!(
                timestamp,
                pilot_filter = self.filters.pilot.enabled,
                pilot_user_ids = ?self.filters.pilot.user_ids,
                "sync started"
            );

            let envelope = self
                .upstream
                .get_customers(
                    &CustomerFilter::created_on(date_range.date_end.clone()),
                    CUSTOMER_PAGE_SIZE,
                )
                .await;
            if !envelope.success {
                error!(status = envelope.status, "failed to fetch customers from auvo");
                result.aborted = Some(format!(
                    "customer fetch failed with status {}",
                    envelope.status
                ));
                return result.finish();
            }

            // The upstream creation-date filter is not reliable.
            let all = envelope.into_entities();
            let fetched = all.len();
            let candidates: Vec<Customer> = all
                .into_iter()
                .filter(|c| c.creation_day() == date_range.date_end)
                .collect();
            info!(fetched, candidates = candidates.len(), "customers fetched");
            result.total_candidates = candidates.len();

            let last = candidates.len().saturating_sub(1);
            for (index, customer) in candidates.into_iter().enumerate() {
                let candidate = self.process_candidate(customer, &date_range).await;
                result.push(candidate);
                if index < last && !self.candidate_delay.is_zero() {
                    tokio::time::sleep(self.candidate_delay).await;
                }
            }

            let result = result.finish();
            info!(
                total = result.total_candidates,
                processed = result.processed,
                skipped = result.skipped,
                errors = result.errors,
                duration_ms = result.duration_ms,
                "sync completed"
            );
            result
        }
        .instrument(span)
        .await;
        Ok(result)
    }

    async fn process_candidate(&self, customer: Customer, range: &DateRange) -> CandidateResult {
        let upstream_id = UpstreamId(customer.id);
        let span = info_span!("candidate", upstream_id = customer.id);
        async {
            info!(company = %customer.description, "processing customer");
            let mut request_id = None;
            let outcome = match self.advance(customer, range, &mut request_id).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(error = %err, "candidate failed");
                    CandidateOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            if let CandidateOutcome::Skipped(reason) = &outcome {
                info!(%reason, "candidate skipped");
            }
            CandidateResult {
                upstream_id,
                request_id,
                outcome,
            }
        }
        .instrument(span)
        .await
    }

    /// FETCHED -> SKIPPED | RESERVED -> PERSISTED -> PROCESSED | FAILED
    async fn advance(
        &self,
        customer: Customer,
        range: &DateRange,
        request_id: &mut Option<i64>,
    ) -> Result<CandidateOutcome, SyncError> {
        let upstream_id = UpstreamId(customer.id);
        let ledger = self.delivery.ledger();
        let requests = self.delivery.requests();

        if ledger.exists(upstream_id).await? {
            return Ok(CandidateOutcome::Skipped(SkipReason::AlreadyInLedger));
        }
        if let Some(existing) = requests.find_by_upstream_id(upstream_id).await? {
            return Ok(CandidateOutcome::Skipped(SkipReason::LocalRequestExists {
                request_id: existing.id,
                status: existing.status,
            }));
        }

        let tasks = self
            .upstream
            .get_tasks_by_customer(customer.id, range)
            .await;
        let first = if tasks.success { tasks.into_first() } else { None };
        let Some(task) = first else {
            return Ok(CandidateOutcome::Skipped(SkipReason::NoTask));
        };

        let Some(user) = self.upstream.get_user_by_name(&task.user_from_name).await else {
            return Ok(CandidateOutcome::Skipped(SkipReason::UserNotFound {
                name: task.user_from_name,
            }));
        };
        if !self.filters.is_qualifying_role(&user.job_position) {
            return Ok(CandidateOutcome::Skipped(SkipReason::NotQualifyingRole {
                job_position: user.job_position,
            }));
        }
        if !self.filters.pilot.allows(user.user_id) {
            return Ok(CandidateOutcome::Skipped(SkipReason::NotInPilot {
                user_id: user.user_id,
            }));
        }

        let payload = self.builder.build(customer, task, user).await;
        let stored = payload.to_stored()?;

        if !ledger.reserve(upstream_id).await? {
            return Ok(CandidateOutcome::Skipped(SkipReason::ReservationLost));
        }

        let created = requests
            .create(NewLeadRequest {
                upstream_id: Some(upstream_id),
                payload: stored,
                status: LeadStatus::Processing,
                source: SOURCE_SYNC.to_string(),
            })
            .await;
        let row = match created {
            Ok(row) => row,
            Err(err) => {
                release_after_failed_insert(ledger, upstream_id).await;
                if err.is_conflict() {
                    if let Some(existing) = requests.find_by_upstream_id(upstream_id).await? {
                        return Ok(CandidateOutcome::Skipped(SkipReason::LocalRequestExists {
                            request_id: existing.id,
                            status: existing.status,
                        }));
                    }
                }
                return Err(err.into());
            }
        };
        *request_id = Some(row.id);
        info!(request_id = row.id, "lead request persisted, mapping reserved");

        Ok(
            match self
                .delivery
                .deliver(row.id, Some(upstream_id), &payload, false)
                .await?
            {
                DeliveryOutcome::Processed { crm_record_id } => {
                    CandidateOutcome::Processed { crm_record_id }
                }
                DeliveryOutcome::Failed { error } => CandidateOutcome::Failed { error },
            },
        )
    }
}

/// The reservation guards a row that was never written; hand it back.
pub(crate) async fn release_after_failed_insert(
    ledger: &dyn LeadLedger,
    upstream_id: UpstreamId,
) {
    match ledger.release(upstream_id).await {
        Ok(_) => {}
        Err(err) => {
            warn!(upstream_id = %upstream_id, error = %err, "could not release reservation")
        }
    }
}

#[cfg(test)]
mod tests {
    use leadsync_core::{MappingState, SOURCE_WEBHOOK};
    use leadsync_storage::LeadRequestStore;

    use super::*;
    use crate::testing::{consultant, customer, task_for, Harness};

    const TS: &str = "2025-12-10T15:00:00Z";
    const DAY: &str = "2025-12-10";

    #[tokio::test]
    async fn new_customer_becomes_a_confirmed_lead() {
        let harness = Harness::new(vec![customer(1, DAY)]);
        let result = harness.orchestrator().sync(TS).await.unwrap();

        assert_eq!(result.date_range.date_end, DAY);
        assert_eq!(result.date_range.date_start, "2025-12-09");
        assert_eq!((result.total_candidates, result.processed), (1, 1));
        assert_eq!(
            result.outcomes[0].outcome,
            CandidateOutcome::Processed {
                crm_record_id: CrmRecordId::new("crm-1")
            }
        );
        assert_eq!(harness.creator.companies(), vec!["EMPRESA 1".to_string()]);

        let row = harness
            .requests
            .find_by_upstream_id(UpstreamId(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, LeadStatus::Processed);
        assert_eq!(row.source, SOURCE_SYNC);
        assert_eq!(row.retry_count, 0);
        assert!(row.payload.starts_with('['));
        assert_eq!(
            harness.ledger.state(UpstreamId(1)).await.unwrap(),
            Some(MappingState::Confirmed(CrmRecordId::new("crm-1")))
        );
    }

    #[tokio::test]
    async fn customers_created_on_other_days_are_ignored() {
        let harness = Harness::new(vec![customer(1, "2025-12-09"), customer(2, DAY)]);
        let result = harness.orchestrator().sync(TS).await.unwrap();
        assert_eq!(result.total_candidates, 1);
        assert_eq!(result.outcomes[0].upstream_id, UpstreamId(2));
    }

    #[tokio::test]
    async fn each_gate_skips_without_calling_the_creator() {
        let harness = Harness::new((1..=6).map(|id| customer(id, DAY)).collect());
        harness
            .ledger
            .confirm(UpstreamId(1), &CrmRecordId::new("900"))
            .await
            .unwrap();
        let existing = harness
            .requests
            .create(NewLeadRequest {
                upstream_id: Some(UpstreamId(2)),
                payload: harness.stored_payload(2),
                status: LeadStatus::Failed,
                source: SOURCE_WEBHOOK.into(),
            })
            .await
            .unwrap();
        harness.upstream.set_tasks(3, Vec::new());
        let mut orphan = task_for(4);
        orphan.user_from_name = "Desconhecido".into();
        harness.upstream.set_tasks(4, vec![orphan]);
        let mut manager = task_for(5);
        manager.user_from_name = "Ana Gerente".into();
        harness.upstream.set_tasks(5, vec![manager]);
        let mut outsider = task_for(6);
        outsider.user_from_name = "Pedro Fora".into();
        harness.upstream.set_tasks(6, vec![outsider]);

        let mut ana = consultant(101, "Gerente");
        ana.name = "Ana Gerente".into();
        let mut pedro = consultant(102, "CONSULTOR");
        pedro.name = "Pedro Fora".into();
        harness
            .upstream
            .set_users(vec![consultant(100, "Consultor"), ana, pedro]);

        let result = harness.orchestrator().sync(TS).await.unwrap();
        let reasons: Vec<_> = result
            .outcomes
            .iter()
            .map(|o| match &o.outcome {
                CandidateOutcome::Skipped(reason) => reason.clone(),
                other => panic!("unexpected outcome {other:?}"),
            })
            .collect();
        assert_eq!(
            reasons,
            vec![
                SkipReason::AlreadyInLedger,
                SkipReason::LocalRequestExists {
                    request_id: existing.id,
                    status: LeadStatus::Failed
                },
                SkipReason::NoTask,
                SkipReason::UserNotFound {
                    name: "Desconhecido".into()
                },
                SkipReason::NotQualifyingRole {
                    job_position: "Gerente".into()
                },
                SkipReason::NotInPilot { user_id: 102 },
            ]
        );
        assert_eq!(result.skipped, 6);
        assert_eq!(harness.creator.calls(), 0);
        // Skipped candidates never leave a reservation behind.
        assert_eq!(harness.ledger.len().await, 1);
        assert_eq!(harness.requests.all().await.len(), 1);
    }

    #[tokio::test]
    async fn creator_failure_keeps_the_reservation_and_notifies() {
        let harness = Harness::new(vec![customer(1, DAY)]);
        harness.creator.fail_next("connection reset");

        let result = harness.orchestrator().sync(TS).await.unwrap();
        assert_eq!(result.errors, 1);
        let row = harness
            .requests
            .find_by_upstream_id(UpstreamId(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, LeadStatus::Failed);
        assert_eq!(row.retry_count, 0);
        assert!(row.crm_record_id.is_none());
        assert!(row.error_message.unwrap().contains("connection reset"));
        assert_eq!(
            harness.ledger.state(UpstreamId(1)).await.unwrap(),
            Some(MappingState::Failed)
        );

        let sent = harness.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].upstream_id, Some(1));
        assert_eq!(
            sent[0].retry_url,
            format!("http://localhost:3000/webhook/lead/{}/retry", row.id)
        );

        // The next run leaves the failed lead to the dead-letter path.
        let again = harness.orchestrator().sync(TS).await.unwrap();
        assert!(matches!(
            again.outcomes[0].outcome,
            CandidateOutcome::Skipped(SkipReason::AlreadyInLedger)
        ));
        assert_eq!(harness.creator.calls(), 1);
    }

    #[tokio::test]
    async fn failed_customer_fetch_aborts_the_run() {
        let harness = Harness::new(vec![customer(1, DAY)]);
        harness.upstream_fails();
        let result = harness.orchestrator().sync(TS).await.unwrap();
        assert!(result.aborted.is_some());
        assert_eq!(result.total_candidates, 0);
        assert_eq!(harness.creator.calls(), 0);
    }

    #[tokio::test]
    async fn unparseable_timestamp_is_rejected() {
        let harness = Harness::new(Vec::new());
        let err = harness.orchestrator().sync("yesterday").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTimestamp(_)));
    }
}
