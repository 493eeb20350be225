//! Auvo → CRM lead sync.
//!
//! Three entry points share one delivery protocol: the scheduled sync run
//! ([`SyncOrchestrator`]), single-payload intake ([`LeadIntake`]) and the
//! dead-letter reprocessor ([`DeadLetterService`]). Each reserves the Auvo
//! customer id in the entity-mapping ledger before it calls the CRM Lead
//! Creator, so a lead is created at most once per customer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use leadsync_adapters::{
    AuvoClient, AuvoConfig, Geocoder, GoogleGeocoder, HttpClientConfig, HttpLeadCreator,
    Notifier, TracingNotifier, WebhookNotifier,
};
use leadsync_storage::{PgLeadLedger, PgLeadRequestStore, PgPool, PoolConfig, StoreError};
use thiserror::Error;
use tracing::{info, warn};

pub mod config;
pub mod dates;
pub mod delivery;
pub mod dlq;
pub mod intake;
pub mod observability;
pub mod orchestrator;
pub mod payload;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use config::{FilterConfig, SyncConfig, UserAllowlist};
pub use dates::{current_timestamp, resolve_date_range, InvalidTimestamp};
pub use delivery::{Delivery, DeliveryOutcome};
pub use dlq::{
    DeadLetterService, FailedLead, LeadStats, PayloadDiff, ReprocessOutcome, ReprocessStats,
};
pub use intake::{IntakeOutcome, LeadIntake};
pub use observability::{init_logging, LogFormat};
pub use orchestrator::{
    CandidateOutcome, CandidateResult, SkipReason, SyncOrchestrator, SyncResult,
};
pub use payload::PayloadBuilder;
pub use scheduler::{RunGate, ScheduleSettings, SchedulerStats, SyncScheduler, TickOutcome};

pub const CRATE_NAME: &str = "leadsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    InvalidTimestamp(#[from] InvalidTimestamp),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("lead request {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Production wiring: Postgres stores, the Auvo client, Google geocoding when
/// a key is set, the HTTP Lead Creator and the failure notifier.
pub struct LeadSyncApp {
    config: SyncConfig,
    local_pool: PgPool,
    ledger_pool: PgPool,
    orchestrator: Arc<SyncOrchestrator>,
    intake: LeadIntake,
    dead_letters: Arc<DeadLetterService>,
}

impl LeadSyncApp {
    pub async fn from_env() -> Result<Self> {
        let config = SyncConfig::from_env().with_filter_file()?;
        Self::from_config(config).await
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let mut pool_config = PoolConfig::new(config.database_url.clone());
        pool_config.max_connections = config.database_max_connections;
        let local_pool = leadsync_storage::connect(&pool_config)
            .await
            .context("connecting to the local database")?;
        let ledger_pool = if config.integration_database_url == config.database_url {
            local_pool.clone()
        } else {
            pool_config.url = config.integration_database_url.clone();
            leadsync_storage::connect(&pool_config)
                .await
                .context("connecting to the integration database")?
        };

        let http = HttpClientConfig::default()
            .with_timeout(Duration::from_secs(config.http_timeout_secs));
        if config.auvo_api_key.is_empty() || config.auvo_api_token.is_empty() {
            warn!("AUVO_API_KEY or AUVO_API_TOKEN is empty; upstream calls will fail");
        }
        let upstream = AuvoClient::new(
            AuvoConfig {
                api_url: config.auvo_api_url.clone(),
                api_key: config.auvo_api_key.clone(),
                api_token: config.auvo_api_token.clone(),
            },
            &http,
        )?;
        let geocoder: Option<Arc<dyn Geocoder>> = match &config.google_maps_api_key {
            Some(key) => Some(Arc::new(GoogleGeocoder::new(key.clone(), &http)?)),
            None => {
                info!("GOOGLE_MAPS_API_KEY not set; addresses use the free-text parser");
                None
            }
        };
        let creator = HttpLeadCreator::new(
            config.crm_creator_url.clone(),
            config.crm_creator_token.clone(),
            &http
                .clone()
                .with_timeout(Duration::from_secs(config.crm_creator_timeout_secs)),
        )?;
        let notifier: Arc<dyn Notifier> = match &config.error_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone(), &http)?),
            None => Arc::new(TracingNotifier),
        };

        let delivery = Delivery::new(
            Arc::new(creator),
            Arc::new(PgLeadLedger::new(ledger_pool.clone())),
            Arc::new(PgLeadRequestStore::new(local_pool.clone())),
            notifier,
            config.api_base_url.clone(),
        );
        let builder = PayloadBuilder::new(geocoder, config.filters.geocoding.clone())
            .context("compiling payload patterns")?;
        let orchestrator = SyncOrchestrator::new(
            Arc::new(upstream),
            Arc::new(builder),
            delivery.clone(),
            config.filters.clone(),
        )
        .with_candidate_delay(Duration::from_millis(config.candidate_delay_ms));
        let dead_letters = DeadLetterService::new(delivery.clone())
            .with_batch_delay(Duration::from_millis(config.batch_delay_ms))
            .with_stuck_after(chrono::Duration::minutes(config.stuck_processing_minutes));

        Ok(Self {
            intake: LeadIntake::new(delivery),
            orchestrator: Arc::new(orchestrator),
            dead_letters: Arc::new(dead_letters),
            local_pool,
            ledger_pool,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn intake(&self) -> &LeadIntake {
        &self.intake
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterService> {
        &self.dead_letters
    }

    pub fn scheduler(&self) -> SyncScheduler {
        SyncScheduler::new(
            self.orchestrator.clone(),
            self.dead_letters.clone(),
            ScheduleSettings {
                sync_cron: self.config.sync_cron.clone(),
                dlq_cron: self.config.dlq_cron.clone(),
                run_immediately: self.config.run_immediately,
                dlq_sweep_enabled: self.config.dlq_sweep_enabled,
                dlq_max_retries: self.config.dlq_max_retries,
            },
        )
    }

    /// Applies the `lead_requests` schema, and the `entity_mapping` schema
    /// when `include_ledger` is set.
    pub async fn migrate(&self, include_ledger: bool) -> Result<()> {
        leadsync_storage::migrate_local(&self.local_pool)
            .await
            .context("migrating lead_requests")?;
        if include_ledger {
            leadsync_storage::migrate_ledger(&self.ledger_pool)
                .await
                .context("migrating entity_mapping")?;
        }
        Ok(())
    }
}

/// One sync run for the local day of `timestamp`, or of now when absent.
pub async fn run_sync_once_from_env(timestamp: Option<&str>) -> Result<SyncResult> {
    let app = LeadSyncApp::from_env().await?;
    let timestamp = timestamp.map_or_else(current_timestamp, str::to_string);
    let result = app.orchestrator().sync(&timestamp).await?;
    Ok(result)
}
