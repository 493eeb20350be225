//! Core domain model for the Auvo → CRM lead sync.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod payload;
pub mod upstream;

pub use payload::{LeadFields, LeadPayload, PayloadContext};
pub use upstream::{
    ApiData, ApiEnvelope, ApiLink, ApiPaging, ApiResult, Contact, Customer, Task, User,
};

pub const CRATE_NAME: &str = "leadsync-core";

/// Provenance tag for rows created by the webhook intake path.
pub const SOURCE_WEBHOOK: &str = "WEBHOOK";
/// Provenance tag for rows created by the scheduled Auvo sync.
pub const SOURCE_SYNC: &str = "AUVO_SYNC";

/// Ledger entity type for leads.
pub const ENTITY_TYPE_LEAD: &str = "lead";

/// Auvo customer id. Auvo issues numeric ids; the ledger stores them as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpstreamId(pub i64);

impl UpstreamId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UpstreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UpstreamId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Record id returned by the CRM once a lead exists there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrmRecordId(pub String);

impl CrmRecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CrmRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
#[error("unknown lead status `{0}`")]
pub struct UnknownStatus(pub String);

/// Lifecycle of a local lead request row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl LeadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Processed => "PROCESSED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "PROCESSED" => Ok(Self::Processed),
            "FAILED" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One lead-creation attempt as recorded in the local request log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadRequest {
    pub id: i64,
    pub upstream_id: Option<UpstreamId>,
    pub payload: String,
    pub original_payload: Option<String>,
    pub status: LeadStatus,
    pub crm_record_id: Option<CrmRecordId>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl LeadRequest {
    pub fn payload_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.payload)
    }

    pub fn original_payload_json(&self) -> serde_json::Result<Option<serde_json::Value>> {
        self.original_payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
    }
}

/// Insert contract for the local request log.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLeadRequest {
    pub upstream_id: Option<UpstreamId>,
    pub payload: String,
    pub status: LeadStatus,
    pub source: String,
}

/// Decoded `crm_id` column of the external entity-mapping ledger.
///
/// The table itself stores `PENDING` / `FAILED` sentinels in the same column
/// as real CRM ids; decoding happens only at the storage boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "crm_id", rename_all = "snake_case")]
pub enum MappingState {
    Reserved,
    Confirmed(CrmRecordId),
    Failed,
}

impl MappingState {
    pub const RESERVED_SENTINEL: &'static str = "PENDING";
    pub const FAILED_SENTINEL: &'static str = "FAILED";

    /// A NULL column is treated as an open reservation: the row exists but no
    /// CRM id was ever recorded.
    pub fn from_column(value: Option<&str>) -> Self {
        match value {
            None => Self::Reserved,
            Some(Self::RESERVED_SENTINEL) => Self::Reserved,
            Some(Self::FAILED_SENTINEL) => Self::Failed,
            Some(id) if id.trim().is_empty() => Self::Reserved,
            Some(id) => Self::Confirmed(CrmRecordId::new(id)),
        }
    }

    pub fn to_column(&self) -> &str {
        match self {
            Self::Reserved => Self::RESERVED_SENTINEL,
            Self::Failed => Self::FAILED_SENTINEL,
            Self::Confirmed(id) => id.as_str(),
        }
    }

    pub fn is_releasable(&self) -> bool {
        !matches!(self, Self::Confirmed(_))
    }
}

/// Row of the external entity-mapping ledger, scoped to leads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMapping {
    pub id: i64,
    pub upstream_id: String,
    pub state: MappingState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upstream date window: `date_end` is "today", `date_start` the day before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub date_start: String,
    pub date_end: String,
}
