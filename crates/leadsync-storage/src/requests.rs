//! Local lead request log (`lead_requests`).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadsync_core::{CrmRecordId, LeadRequest, LeadStatus, NewLeadRequest, UpstreamId};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;

use crate::{is_unique_violation, StoreError, StoreResult};

/// Result of trying to move a row into PROCESSING for a retry.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(LeadRequest),
    AlreadyProcessed(LeadRequest),
    InProgress(LeadRequest),
    /// Still FAILED or PENDING, but other workers kept winning the update.
    Contended(LeadRequest),
    NotFound,
}

/// Conditional updates tried before a claimable row is reported contended.
const CLAIM_ATTEMPTS: u32 = 2;

/// Outcome for a row the claim did not move. `Err` hands the row back when
/// it is claimable again.
fn unclaimed_outcome(row: LeadRequest) -> Result<ClaimOutcome, LeadRequest> {
    match row.status {
        LeadStatus::Processed => Ok(ClaimOutcome::AlreadyProcessed(row)),
        LeadStatus::Processing => Ok(ClaimOutcome::InProgress(row)),
        LeadStatus::Failed | LeadStatus::Pending => Err(row),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailedLeadFilter {
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub min_retry_count: Option<i32>,
    pub max_retry_count: Option<i32>,
}

impl FailedLeadFilter {
    fn matches(&self, row: &LeadRequest) -> bool {
        row.status == LeadStatus::Failed
            && self.created_from.map_or(true, |from| row.created_at >= from)
            && self.created_to.map_or(true, |to| row.created_at <= to)
            && self.source.as_deref().map_or(true, |s| row.source == s)
            && self.min_retry_count.map_or(true, |min| row.retry_count >= min)
            && self.max_retry_count.map_or(true, |max| row.retry_count <= max)
    }
}

/// Raw counters behind the dead-letter statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: i64,
    pub failed: i64,
    pub processed: i64,
    pub processing: i64,
    pub failed_since: i64,
    pub processed_since: i64,
}

#[async_trait]
pub trait LeadRequestStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when `upstream_id` already has a row.
    async fn create(&self, new: NewLeadRequest) -> StoreResult<LeadRequest>;

    async fn get(&self, id: i64) -> StoreResult<Option<LeadRequest>>;

    async fn find_by_upstream_id(&self, upstream_id: UpstreamId)
        -> StoreResult<Option<LeadRequest>>;

    /// Conditional `FAILED | PENDING -> PROCESSING`. Concurrent callers on the
    /// same row get exactly one `Claimed`.
    async fn claim_for_retry(&self, id: i64) -> StoreResult<ClaimOutcome>;

    async fn record_success(
        &self,
        id: i64,
        crm_id: &CrmRecordId,
        count_retry: bool,
    ) -> StoreResult<LeadRequest>;

    async fn record_failure(
        &self,
        id: i64,
        error_message: &str,
        count_retry: bool,
    ) -> StoreResult<LeadRequest>;

    /// Replaces the payload, keeping the first pre-edit payload in
    /// `original_payload`.
    async fn update_payload(&self, id: i64, payload: String) -> StoreResult<LeadRequest>;

    /// FAILED rows matching `filter`, newest first.
    async fn list_failed(&self, filter: &FailedLeadFilter) -> StoreResult<Vec<LeadRequest>>;

    async fn failed_ids_below_retry_cap(&self, max_retries: i32) -> StoreResult<Vec<i64>>;

    async fn stats(&self, since: DateTime<Utc>) -> StoreResult<RequestCounts>;

    /// Moves PROCESSING rows last touched before `cutoff` to FAILED.
    async fn fail_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        error_message: &str,
    ) -> StoreResult<u64>;
}

#[derive(Debug, Clone)]
pub struct PgLeadRequestStore {
    pool: PgPool,
}

impl PgLeadRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const COLUMNS: &str = "id, upstream_id, payload, original_payload, status, crm_record_id, \
     error_message, retry_count, source, created_at, updated_at, last_retry_at";

fn request_from_row(row: &PgRow) -> StoreResult<LeadRequest> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<LeadStatus>()
        .map_err(|err| StoreError::Corrupt(err.to_string()))?;
    let upstream_id: Option<i64> = row.try_get("upstream_id")?;
    let crm_record_id: Option<String> = row.try_get("crm_record_id")?;
    Ok(LeadRequest {
        id: row.try_get("id")?,
        upstream_id: upstream_id.map(UpstreamId),
        payload: row.try_get("payload")?,
        original_payload: row.try_get("original_payload")?,
        status,
        crm_record_id: crm_record_id.map(CrmRecordId),
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        source: row.try_get("source")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_retry_at: row.try_get("last_retry_at")?,
    })
}

#[async_trait]
impl LeadRequestStore for PgLeadRequestStore {
    async fn create(&self, new: NewLeadRequest) -> StoreResult<LeadRequest> {
        let sql = format!(
            r#"
            INSERT INTO lead_requests (upstream_id, payload, status, source, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            RETURNING {COLUMNS}
            "#
        );
        let result = sqlx::query(&sql)
            .bind(new.upstream_id.map(UpstreamId::get))
            .bind(&new.payload)
            .bind(new.status.as_str())
            .bind(&new.source)
            .fetch_one(&self.pool)
            .await;
        match result {
            Ok(row) => request_from_row(&row),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict(format!(
                "lead request for upstream id {} already exists",
                new.upstream_id.map(|id| id.to_string()).unwrap_or_default()
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, id: i64) -> StoreResult<Option<LeadRequest>> {
        let sql = format!("SELECT {COLUMNS} FROM lead_requests WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn find_by_upstream_id(
        &self,
        upstream_id: UpstreamId,
    ) -> StoreResult<Option<LeadRequest>> {
        let sql = format!("SELECT {COLUMNS} FROM lead_requests WHERE upstream_id = $1");
        let row = sqlx::query(&sql)
            .bind(upstream_id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn claim_for_retry(&self, id: i64) -> StoreResult<ClaimOutcome> {
        let sql = format!(
            r#"
            UPDATE lead_requests
               SET status = 'PROCESSING',
                   updated_at = NOW()
             WHERE id = $1
               AND status IN ('FAILED', 'PENDING')
            RETURNING {COLUMNS}
            "#
        );
        let mut attempt = 1;
        loop {
            if let Some(row) = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            {
                return Ok(ClaimOutcome::Claimed(request_from_row(&row)?));
            }
            let Some(row) = self.get(id).await? else {
                return Ok(ClaimOutcome::NotFound);
            };
            // The row can be released again between the update and the reread.
            match unclaimed_outcome(row) {
                Ok(outcome) => return Ok(outcome),
                Err(row) if attempt >= CLAIM_ATTEMPTS => return Ok(ClaimOutcome::Contended(row)),
                Err(_) => attempt += 1,
            }
        }
    }

    async fn record_success(
        &self,
        id: i64,
        crm_id: &CrmRecordId,
        count_retry: bool,
    ) -> StoreResult<LeadRequest> {
        let sql = format!(
            r#"
            UPDATE lead_requests
               SET status = 'PROCESSED',
                   crm_record_id = $2,
                   error_message = NULL,
                   retry_count = retry_count + CASE WHEN $3 THEN 1 ELSE 0 END,
                   last_retry_at = CASE WHEN $3 THEN NOW() ELSE last_retry_at END,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(crm_id.as_str())
            .bind(count_retry)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        request_from_row(&row)
    }

    async fn record_failure(
        &self,
        id: i64,
        error_message: &str,
        count_retry: bool,
    ) -> StoreResult<LeadRequest> {
        let sql = format!(
            r#"
            UPDATE lead_requests
               SET status = 'FAILED',
                   crm_record_id = NULL,
                   error_message = $2,
                   retry_count = retry_count + CASE WHEN $3 THEN 1 ELSE 0 END,
                   last_retry_at = CASE WHEN $3 THEN NOW() ELSE last_retry_at END,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(error_message)
            .bind(count_retry)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        request_from_row(&row)
    }

    async fn update_payload(&self, id: i64, payload: String) -> StoreResult<LeadRequest> {
        let sql = format!(
            r#"
            UPDATE lead_requests
               SET original_payload = COALESCE(original_payload, payload),
                   payload = $2,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(payload)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        request_from_row(&row)
    }

    async fn list_failed(&self, filter: &FailedLeadFilter) -> StoreResult<Vec<LeadRequest>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
              FROM lead_requests
             WHERE status = 'FAILED'
               AND ($1::timestamptz IS NULL OR created_at >= $1)
               AND ($2::timestamptz IS NULL OR created_at <= $2)
               AND ($3::text IS NULL OR source = $3)
               AND ($4::int IS NULL OR retry_count >= $4)
               AND ($5::int IS NULL OR retry_count <= $5)
             ORDER BY created_at DESC, id DESC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.created_from)
            .bind(filter.created_to)
            .bind(filter.source.as_deref())
            .bind(filter.min_retry_count)
            .bind(filter.max_retry_count)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn failed_ids_below_retry_cap(&self, max_retries: i32) -> StoreResult<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT id
              FROM lead_requests
             WHERE status = 'FAILED'
               AND retry_count < $1
             ORDER BY id ASC
            "#,
        )
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(StoreError::from))
            .collect()
    }

    async fn stats(&self, since: DateTime<Utc>) -> StoreResult<RequestCounts> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'FAILED') AS failed,
                   COUNT(*) FILTER (WHERE status = 'PROCESSED') AS processed,
                   COUNT(*) FILTER (WHERE status = 'PROCESSING') AS processing,
                   COUNT(*) FILTER (WHERE status = 'FAILED' AND created_at >= $1) AS failed_since,
                   COUNT(*) FILTER (WHERE status = 'PROCESSED' AND created_at >= $1) AS processed_since
              FROM lead_requests
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(RequestCounts {
            total: row.try_get("total")?,
            failed: row.try_get("failed")?,
            processed: row.try_get("processed")?,
            processing: row.try_get("processing")?,
            failed_since: row.try_get("failed_since")?,
            processed_since: row.try_get("processed_since")?,
        })
    }

    async fn fail_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        error_message: &str,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE lead_requests
               SET status = 'FAILED',
                   error_message = $2,
                   updated_at = NOW()
             WHERE status = 'PROCESSING'
               AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Process-local request log with the same transition rules as the Postgres
/// store. Backs tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLeadRequestStore {
    inner: Mutex<MemoryRequestState>,
}

#[derive(Debug, Default)]
struct MemoryRequestState {
    next_id: i64,
    rows: BTreeMap<i64, LeadRequest>,
}

impl MemoryRequestState {
    fn row_mut(&mut self, id: i64) -> StoreResult<&mut LeadRequest> {
        self.rows.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

impl MemoryLeadRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<LeadRequest> {
        self.inner.lock().await.rows.values().cloned().collect()
    }
}

#[async_trait]
impl LeadRequestStore for MemoryLeadRequestStore {
    async fn create(&self, new: NewLeadRequest) -> StoreResult<LeadRequest> {
        let mut inner = self.inner.lock().await;
        if let Some(upstream_id) = new.upstream_id {
            if inner.rows.values().any(|r| r.upstream_id == Some(upstream_id)) {
                return Err(StoreError::Conflict(format!(
                    "lead request for upstream id {upstream_id} already exists"
                )));
            }
        }
        inner.next_id += 1;
        let now = Utc::now();
        let row = LeadRequest {
            id: inner.next_id,
            upstream_id: new.upstream_id,
            payload: new.payload,
            original_payload: None,
            status: new.status,
            crm_record_id: None,
            error_message: None,
            retry_count: 0,
            source: new.source,
            created_at: now,
            updated_at: now,
            last_retry_at: None,
        };
        inner.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<LeadRequest>> {
        Ok(self.inner.lock().await.rows.get(&id).cloned())
    }

    async fn find_by_upstream_id(
        &self,
        upstream_id: UpstreamId,
    ) -> StoreResult<Option<LeadRequest>> {
        Ok(self
            .inner
            .lock()
            .await
            .rows
            .values()
            .find(|r| r.upstream_id == Some(upstream_id))
            .cloned())
    }

    async fn claim_for_retry(&self, id: i64) -> StoreResult<ClaimOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.rows.get_mut(&id) else {
            return Ok(ClaimOutcome::NotFound);
        };
        Ok(match unclaimed_outcome(row.clone()) {
            Ok(outcome) => outcome,
            Err(_) => {
                row.status = LeadStatus::Processing;
                row.updated_at = Utc::now();
                ClaimOutcome::Claimed(row.clone())
            }
        })
    }

    async fn record_success(
        &self,
        id: i64,
        crm_id: &CrmRecordId,
        count_retry: bool,
    ) -> StoreResult<LeadRequest> {
        let mut inner = self.inner.lock().await;
        let row = inner.row_mut(id)?;
        let now = Utc::now();
        row.status = LeadStatus::Processed;
        row.crm_record_id = Some(crm_id.clone());
        row.error_message = None;
        if count_retry {
            row.retry_count += 1;
            row.last_retry_at = Some(now);
        }
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn record_failure(
        &self,
        id: i64,
        error_message: &str,
        count_retry: bool,
    ) -> StoreResult<LeadRequest> {
        let mut inner = self.inner.lock().await;
        let row = inner.row_mut(id)?;
        let now = Utc::now();
        row.status = LeadStatus::Failed;
        row.crm_record_id = None;
        row.error_message = Some(error_message.to_string());
        if count_retry {
            row.retry_count += 1;
            row.last_retry_at = Some(now);
        }
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn update_payload(&self, id: i64, payload: String) -> StoreResult<LeadRequest> {
        let mut inner = self.inner.lock().await;
        let row = inner.row_mut(id)?;
        if row.original_payload.is_none() {
            row.original_payload = Some(row.payload.clone());
        }
        row.payload = payload;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn list_failed(&self, filter: &FailedLeadFilter) -> StoreResult<Vec<LeadRequest>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .rows
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(rows)
    }

    async fn failed_ids_below_retry_cap(&self, max_retries: i32) -> StoreResult<Vec<i64>> {
        Ok(self
            .inner
            .lock()
            .await
            .rows
            .values()
            .filter(|r| r.status == LeadStatus::Failed && r.retry_count < max_retries)
            .map(|r| r.id)
            .collect())
    }

    async fn stats(&self, since: DateTime<Utc>) -> StoreResult<RequestCounts> {
        let inner = self.inner.lock().await;
        let mut counts = RequestCounts::default();
        for row in inner.rows.values() {
            counts.total += 1;
            match row.status {
                LeadStatus::Failed => {
                    counts.failed += 1;
                    if row.created_at >= since {
                        counts.failed_since += 1;
                    }
                }
                LeadStatus::Processed => {
                    counts.processed += 1;
                    if row.created_at >= since {
                        counts.processed_since += 1;
                    }
                }
                LeadStatus::Processing => counts.processing += 1,
                LeadStatus::Pending => {}
            }
        }
        Ok(counts)
    }

    async fn fail_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        error_message: &str,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut moved = 0;
        for row in inner.rows.values_mut() {
            if row.status == LeadStatus::Processing && row.updated_at < cutoff {
                row.status = LeadStatus::Failed;
                row.error_message = Some(error_message.to_string());
                row.updated_at = now;
                moved += 1;
            }
        }
        Ok(moved)
    }
}
