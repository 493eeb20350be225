//! Periodic triggers for the sync run and the nightly dead-letter sweep.
//!
//! Each trigger owns a [`RunGate`]. A tick that finds its gate taken is
//! logged and dropped, never queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::dates::current_timestamp;
use crate::dlq::DeadLetterService;
use crate::orchestrator::SyncOrchestrator;

#[derive(Debug, Default)]
pub struct RunGate {
    running: AtomicBool,
}

impl RunGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `None` when a run already holds the gate.
    pub fn try_acquire(self: &Arc<Self>) -> Option<RunPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit { gate: self.clone() })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases its gate on drop, including when the run panics.
#[derive(Debug)]
pub struct RunPermit {
    gate: Arc<RunGate>,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.gate.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Sync,
    Sweep,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub trigger: Trigger,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "tick", rename_all = "snake_case")]
pub enum TickOutcome {
    Completed(RunSummary),
    Failed { error: String },
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub skipped_runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<RunSummary>,
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub sync_cron: String,
    pub dlq_cron: String,
    pub run_immediately: bool,
    pub dlq_sweep_enabled: bool,
    pub dlq_max_retries: i32,
}

#[derive(Clone)]
pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    dead_letters: Arc<DeadLetterService>,
    settings: ScheduleSettings,
    sync_gate: Arc<RunGate>,
    sweep_gate: Arc<RunGate>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SyncScheduler {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        dead_letters: Arc<DeadLetterService>,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            orchestrator,
            dead_letters,
            settings,
            sync_gate: RunGate::new(),
            sweep_gate: RunGate::new(),
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
        }
    }

    pub fn sync_gate(&self) -> &Arc<RunGate> {
        &self.sync_gate
    }

    pub fn sweep_gate(&self) -> &Arc<RunGate> {
        &self.sweep_gate
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.stats.lock().await.clone()
    }

    pub async fn run_sync_tick(&self) -> TickOutcome {
        let Some(_permit) = self.sync_gate.try_acquire() else {
            warn!("sync already running, skipping tick");
            return self.finish(TickOutcome::Skipped).await;
        };
        let timestamp = current_timestamp();
        info!(%timestamp, "scheduled sync triggered");
        let outcome = match self.orchestrator.sync(&timestamp).await {
            Ok(result) => match result.aborted {
                Some(reason) => TickOutcome::Failed { error: reason },
                None => TickOutcome::Completed(RunSummary {
                    trigger: Trigger::Sync,
                    finished_at: result.completed_at,
                    processed: result.processed,
                    skipped: result.skipped,
                    errors: result.errors,
                    message: None,
                }),
            },
            Err(err) => TickOutcome::Failed {
                error: err.to_string(),
            },
        };
        self.finish(outcome).await
    }

    /// Recovers stuck rows, then retries FAILED rows under the retry cap.
    pub async fn run_sweep_tick(&self) -> TickOutcome {
        let Some(_permit) = self.sweep_gate.try_acquire() else {
            warn!("dead-letter sweep already running, skipping tick");
            return self.finish(TickOutcome::Skipped).await;
        };
        info!(max_retries = self.settings.dlq_max_retries, "dead-letter sweep triggered");
        let recovered = match self.dead_letters.recover_stuck().await {
            Ok(moved) => moved,
            Err(err) => {
                return self
                    .finish(TickOutcome::Failed {
                        error: err.to_string(),
                    })
                    .await
            }
        };
        let outcome = match self
            .dead_letters
            .reprocess_all_failed(self.settings.dlq_max_retries)
            .await
        {
            Ok(stats) => TickOutcome::Completed(RunSummary {
                trigger: Trigger::Sweep,
                finished_at: Utc::now(),
                processed: stats.success,
                skipped: stats.skipped,
                errors: stats.failed,
                message: (recovered > 0).then(|| format!("recovered {recovered} stuck leads")),
            }),
            Err(err) => TickOutcome::Failed {
                error: err.to_string(),
            },
        };
        self.finish(outcome).await
    }

    async fn finish(&self, outcome: TickOutcome) -> TickOutcome {
        let mut stats = self.stats.lock().await;
        match &outcome {
            TickOutcome::Skipped => stats.skipped_runs += 1,
            TickOutcome::Completed(summary) => {
                stats.total_runs += 1;
                stats.successful_runs += 1;
                stats.last_run_at = Some(summary.finished_at);
                stats.last_result = Some(summary.clone());
            }
            TickOutcome::Failed { error: message } => {
                error!(error = %message, "scheduled run failed");
                stats.total_runs += 1;
                stats.failed_runs += 1;
                stats.last_run_at = Some(Utc::now());
            }
        }
        outcome
    }

    /// Registers both jobs (UTC crons) and starts the scheduler. With
    /// `run_immediately` a sync tick is spawned right away.
    pub async fn start(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let this = self.clone();
        let sync_job = Job::new_async(self.settings.sync_cron.as_str(), move |_uuid, _l| {
            let this = this.clone();
            Box::pin(async move {
                this.run_sync_tick().await;
            })
        })
        .with_context(|| format!("creating sync job for cron {}", self.settings.sync_cron))?;
        sched.add(sync_job).await.context("adding sync job")?;

        if self.settings.dlq_sweep_enabled {
            let this = self.clone();
            let sweep_job = Job::new_async(self.settings.dlq_cron.as_str(), move |_uuid, _l| {
                let this = this.clone();
                Box::pin(async move {
                    this.run_sweep_tick().await;
                })
            })
            .with_context(|| format!("creating sweep job for cron {}", self.settings.dlq_cron))?;
            sched.add(sweep_job).await.context("adding sweep job")?;
        }

        sched.start().await.context("starting scheduler")?;
        info!(
            sync_cron = %self.settings.sync_cron,
            dlq_cron = %self.settings.dlq_cron,
            dlq_sweep = self.settings.dlq_sweep_enabled,
            "scheduler started"
        );

        if self.settings.run_immediately {
            let this = self.clone();
            tokio::spawn(async move {
                this.run_sync_tick().await;
            });
        }
        Ok(sched)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use leadsync_core::{LeadStatus, NewLeadRequest, SOURCE_WEBHOOK};
    use leadsync_storage::LeadRequestStore;

    use super::*;
    use crate::testing::{customer, Harness};

    fn settings() -> ScheduleSettings {
        ScheduleSettings {
            sync_cron: "*/10 * * * *".into(),
            dlq_cron: "0 2 * * *".into(),
            run_immediately: false,
            dlq_sweep_enabled: true,
            dlq_max_retries: 3,
        }
    }

    #[test]
    fn gate_admits_one_holder_at_a_time() {
        let gate = RunGate::new();
        let permit = gate.try_acquire().unwrap();
        assert!(gate.is_running());
        assert!(gate.try_acquire().is_none());
        drop(permit);
        assert!(!gate.is_running());
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn occupied_gate_skips_the_tick() {
        let harness = Harness::new(vec![customer(1, &today())]);
        let scheduler = SyncScheduler::new(
            Arc::new(harness.orchestrator()),
            Arc::new(harness.dead_letters()),
            settings(),
        );

        let held = scheduler.sync_gate().try_acquire().unwrap();
        assert_eq!(scheduler.run_sync_tick().await, TickOutcome::Skipped);
        assert_eq!(harness.creator.calls(), 0);
        drop(held);

        let outcome = scheduler.run_sync_tick().await;
        assert!(matches!(outcome, TickOutcome::Completed(ref s) if s.processed == 1));

        let stats = scheduler.stats().await;
        assert_eq!(stats.skipped_runs, 1);
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.successful_runs, 1);
        assert_eq!(stats.last_result.map(|r| r.trigger), Some(Trigger::Sync));
    }

    #[tokio::test]
    async fn aborted_sync_counts_as_failed_run() {
        let harness = Harness::new(Vec::new());
        harness.upstream_fails();
        let scheduler = SyncScheduler::new(
            Arc::new(harness.orchestrator()),
            Arc::new(harness.dead_letters()),
            settings(),
        );
        assert!(matches!(
            scheduler.run_sync_tick().await,
            TickOutcome::Failed { .. }
        ));
        assert_eq!(scheduler.stats().await.failed_runs, 1);
    }

    #[tokio::test]
    async fn sweep_recovers_stuck_rows_then_retries_them() {
        let harness = Harness::new(Vec::new());
        let row = harness
            .requests
            .create(NewLeadRequest {
                upstream_id: None,
                payload: harness.stored_payload(77),
                status: LeadStatus::Processing,
                source: SOURCE_WEBHOOK.into(),
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let dead_letters = harness
            .dead_letters()
            .with_stuck_after(chrono::Duration::zero());
        let scheduler = SyncScheduler::new(
            Arc::new(harness.orchestrator()),
            Arc::new(dead_letters),
            settings(),
        );

        let outcome = scheduler.run_sweep_tick().await;
        match outcome {
            TickOutcome::Completed(summary) => {
                assert_eq!(summary.trigger, Trigger::Sweep);
                assert_eq!(summary.processed, 1);
                assert_eq!(summary.message.as_deref(), Some("recovered 1 stuck leads"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let row = harness.requests.get(row.id).await.unwrap().unwrap();
        assert_eq!(row.status, LeadStatus::Processed);
        assert_eq!(row.retry_count, 1);
    }

    fn today() -> String {
        crate::dates::local_date(&current_timestamp())
            .unwrap()
            .format("%Y-%m-%d")
            .to_string()
    }
}
