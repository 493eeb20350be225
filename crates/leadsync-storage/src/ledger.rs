//! Entity-mapping ledger: the durable "this upstream id was attempted" record.
//!
//! `reserve` is the one cross-trigger synchronization point. It relies on the
//! unique index over `(entity_type, auvo_id)`, never on check-then-insert.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadsync_core::{CrmRecordId, EntityMapping, MappingState, UpstreamId, ENTITY_TYPE_LEAD};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{is_unique_violation, StoreResult};

#[async_trait]
pub trait LeadLedger: Send + Sync {
    async fn exists(&self, upstream_id: UpstreamId) -> StoreResult<bool>;

    async fn state(&self, upstream_id: UpstreamId) -> StoreResult<Option<MappingState>>;

    /// Atomically claims `upstream_id`. `false` means another caller holds it.
    async fn reserve(&self, upstream_id: UpstreamId) -> StoreResult<bool>;

    /// Records the CRM id, creating the row if a release raced the creation.
    async fn confirm(&self, upstream_id: UpstreamId, crm_id: &CrmRecordId) -> StoreResult<()>;

    /// Moves a reservation to `Failed`. Confirmed rows are left untouched.
    async fn mark_failed(&self, upstream_id: UpstreamId) -> StoreResult<()>;

    /// Deletes a Reserved or Failed row so the id can be attempted again.
    /// Returns whether a row was removed; confirmed rows never are.
    async fn release(&self, upstream_id: UpstreamId) -> StoreResult<bool>;

    /// Reserved or Failed rows, oldest first.
    async fn list_unconfirmed(&self) -> StoreResult<Vec<EntityMapping>>;
}

#[derive(Debug, Clone)]
pub struct PgLeadLedger {
    pool: PgPool,
}

impl PgLeadLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn mapping_from_row(row: &PgRow) -> StoreResult<EntityMapping> {
    let crm_id: Option<String> = row.try_get("crm_id")?;
    let upstream_id: Option<String> = row.try_get("auvo_id")?;
    Ok(EntityMapping {
        id: row.try_get("id")?,
        upstream_id: upstream_id.unwrap_or_default(),
        state: MappingState::from_column(crm_id.as_deref()),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl LeadLedger for PgLeadLedger {
    async fn exists(&self, upstream_id: UpstreamId) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM entity_mapping
                 WHERE entity_type = $1 AND auvo_id = $2
            ) AS present
            "#,
        )
        .bind(ENTITY_TYPE_LEAD)
        .bind(upstream_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("present")?)
    }

    async fn state(&self, upstream_id: UpstreamId) -> StoreResult<Option<MappingState>> {
        let row = sqlx::query(
            r#"
            SELECT crm_id
              FROM entity_mapping
             WHERE entity_type = $1 AND auvo_id = $2
            "#,
        )
        .bind(ENTITY_TYPE_LEAD)
        .bind(upstream_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let crm_id: Option<String> = row.try_get("crm_id")?;
                Ok(Some(MappingState::from_column(crm_id.as_deref())))
            }
            None => Ok(None),
        }
    }

    async fn reserve(&self, upstream_id: UpstreamId) -> StoreResult<bool> {
        let state = MappingState::Reserved;
        let result = sqlx::query(
            r#"
            INSERT INTO entity_mapping (entity_type, auvo_id, crm_id, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            "#,
        )
        .bind(ENTITY_TYPE_LEAD)
        .bind(upstream_id.to_string())
        .bind(state.to_column())
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => {
                debug!(%upstream_id, "ledger reservation already held");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn confirm(&self, upstream_id: UpstreamId, crm_id: &CrmRecordId) -> StoreResult<()> {
        let state = MappingState::Confirmed(crm_id.clone());
        sqlx::query(
            r#"
            INSERT INTO entity_mapping (entity_type, auvo_id, crm_id, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (entity_type, auvo_id)
            DO UPDATE SET crm_id = EXCLUDED.crm_id, updated_at = NOW()
            "#,
        )
        .bind(ENTITY_TYPE_LEAD)
        .bind(upstream_id.to_string())
        .bind(state.to_column())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, upstream_id: UpstreamId) -> StoreResult<()> {
        let state = MappingState::Failed;
        sqlx::query(
            r#"
            UPDATE entity_mapping
               SET crm_id = $3,
                   updated_at = NOW()
             WHERE entity_type = $1
               AND auvo_id = $2
               AND (crm_id IS NULL OR crm_id IN ($4, $3))
            "#,
        )
        .bind(ENTITY_TYPE_LEAD)
        .bind(upstream_id.to_string())
        .bind(state.to_column())
        .bind(MappingState::RESERVED_SENTINEL)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, upstream_id: UpstreamId) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM entity_mapping
             WHERE entity_type = $1
               AND auvo_id = $2
               AND (crm_id IS NULL OR crm_id IN ($3, $4))
            "#,
        )
        .bind(ENTITY_TYPE_LEAD)
        .bind(upstream_id.to_string())
        .bind(MappingState::RESERVED_SENTINEL)
        .bind(MappingState::FAILED_SENTINEL)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_unconfirmed(&self) -> StoreResult<Vec<EntityMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT id, auvo_id, crm_id, created_at, updated_at
              FROM entity_mapping
             WHERE entity_type = $1
               AND (crm_id IS NULL OR crm_id IN ($2, $3))
             ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(ENTITY_TYPE_LEAD)
        .bind(MappingState::RESERVED_SENTINEL)
        .bind(MappingState::FAILED_SENTINEL)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(mapping_from_row).collect()
    }
}

/// Process-local ledger. Reservation is a map insert under a single lock,
/// which gives the same exclusivity as the unique index.
#[derive(Debug, Default)]
pub struct MemoryLeadLedger {
    inner: Mutex<MemoryLedgerState>,
}

#[derive(Debug, Default)]
struct MemoryLedgerState {
    next_id: i64,
    rows: BTreeMap<UpstreamId, EntityMapping>,
}

impl MemoryLedgerState {
    fn insert(&mut self, upstream_id: UpstreamId, state: MappingState, now: DateTime<Utc>) {
        self.next_id += 1;
        self.rows.insert(
            upstream_id,
            EntityMapping {
                id: self.next_id,
                upstream_id: upstream_id.to_string(),
                state,
                created_at: now,
                updated_at: now,
            },
        );
    }
}

impl MemoryLeadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl LeadLedger for MemoryLeadLedger {
    async fn exists(&self, upstream_id: UpstreamId) -> StoreResult<bool> {
        Ok(self.inner.lock().await.rows.contains_key(&upstream_id))
    }

    async fn state(&self, upstream_id: UpstreamId) -> StoreResult<Option<MappingState>> {
        Ok(self
            .inner
            .lock()
            .await
            .rows
            .get(&upstream_id)
            .map(|row| row.state.clone()))
    }

    async fn reserve(&self, upstream_id: UpstreamId) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.rows.contains_key(&upstream_id) {
            return Ok(false);
        }
        inner.insert(upstream_id, MappingState::Reserved, Utc::now());
        Ok(true)
    }

    async fn confirm(&self, upstream_id: UpstreamId, crm_id: &CrmRecordId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        match inner.rows.get_mut(&upstream_id) {
            Some(row) => {
                row.state = MappingState::Confirmed(crm_id.clone());
                row.updated_at = now;
            }
            None => inner.insert(upstream_id, MappingState::Confirmed(crm_id.clone()), now),
        }
        Ok(())
    }

    async fn mark_failed(&self, upstream_id: UpstreamId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.rows.get_mut(&upstream_id) {
            if row.state.is_releasable() {
                row.state = MappingState::Failed;
                row.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn release(&self, upstream_id: UpstreamId) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let releasable = inner
            .rows
            .get(&upstream_id)
            .map(|row| row.state.is_releasable())
            .unwrap_or(false);
        if releasable {
            inner.rows.remove(&upstream_id);
        }
        Ok(releasable)
    }

    async fn list_unconfirmed(&self) -> StoreResult<Vec<EntityMapping>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .rows
            .values()
            .filter(|row| row.state.is_releasable())
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.created_at, row.id));
        Ok(rows)
    }
}
