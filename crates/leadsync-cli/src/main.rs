use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use leadsync_core::SOURCE_WEBHOOK;
use leadsync_storage::FailedLeadFilter;
use leadsync_sync::{init_logging, run_sync_once_from_env, LeadSyncApp, LogFormat};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "leadsync")]
#[command(about = "Auvo to CRM lead sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync for the local day of TIMESTAMP (default: now).
    Sync {
        #[arg(long)]
        timestamp: Option<String>,
    },
    /// Run the sync and dead-letter triggers until interrupted.
    Schedule,
    /// Submit one lead payload (JSON file) through the intake path.
    Submit {
        file: PathBuf,
        #[arg(long, default_value = SOURCE_WEBHOOK)]
        source: String,
    },
    /// Reprocess one or more lead requests by id.
    Reprocess {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Recover stuck rows, then reprocess FAILED rows under the retry cap.
    Sweep {
        #[arg(long)]
        max_retries: Option<i32>,
    },
    /// Merge a JSON patch into a stored payload.
    EditPayload {
        id: i64,
        #[arg(long)]
        patch: String,
    },
    /// List FAILED lead requests.
    Failed {
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        min_retries: Option<i32>,
        #[arg(long)]
        max_retries: Option<i32>,
    },
    Stats,
    /// Show the current payload next to the pre-edit snapshot.
    Diff {
        id: i64,
    },
    /// Move PROCESSING rows past the staleness window to FAILED.
    FixStuck,
    /// List entity-mapping rows still reserved or failed.
    Unconfirmed,
    Migrate {
        /// Also create the entity_mapping table.
        #[arg(long)]
        ledger: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{text}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogFormat::from_env());
    let cli = Cli::parse();

    let command = match cli.command.unwrap_or(Commands::Sync { timestamp: None }) {
        Commands::Sync { timestamp } => {
            let result = run_sync_once_from_env(timestamp.as_deref()).await?;
            return print_json(&result);
        }
        other => other,
    };
    let app = LeadSyncApp::from_env().await?;

    match command {
        Commands::Sync { .. } => {}
        Commands::Schedule => {
            let mut jobs = app.scheduler().start().await?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            jobs.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Submit { file, source } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let outcome = app.intake().submit_payload(&raw, &source).await?;
            print_json(&outcome)?;
        }
        Commands::Reprocess { ids } => {
            if let [id] = ids.as_slice() {
                let outcome = app.dead_letters().reprocess_one(*id).await?;
                print_json(&outcome)?;
            } else {
                let stats = app.dead_letters().reprocess_batch(&ids).await;
                print_json(&stats)?;
            }
        }
        Commands::Sweep { max_retries } => {
            let max_retries = max_retries.unwrap_or(app.config().dlq_max_retries);
            let recovered = app.dead_letters().recover_stuck().await?;
            info!(recovered, "stuck leads recovered");
            let stats = app.dead_letters().reprocess_all_failed(max_retries).await?;
            print_json(&stats)?;
        }
        Commands::EditPayload { id, patch } => {
            let patch: serde_json::Value =
                serde_json::from_str(&patch).context("parsing --patch as JSON")?;
            let row = app.dead_letters().edit_payload(id, &patch).await?;
            print_json(&row)?;
        }
        Commands::Failed {
            from,
            to,
            source,
            min_retries,
            max_retries,
        } => {
            let filter = FailedLeadFilter {
                created_from: from,
                created_to: to,
                source,
                min_retry_count: min_retries,
                max_retry_count: max_retries,
            };
            let leads = app.dead_letters().failed_leads(&filter).await?;
            print_json(&leads)?;
        }
        Commands::Stats => {
            let stats = app.dead_letters().stats().await?;
            print_json(&stats)?;
        }
        Commands::Diff { id } => {
            let diff = app.dead_letters().payload_diff(id).await?;
            print_json(&diff)?;
        }
        Commands::FixStuck => {
            let moved = app.dead_letters().recover_stuck().await?;
            print_json(&serde_json::json!({ "recovered": moved }))?;
        }
        Commands::Unconfirmed => {
            let mappings = app.dead_letters().unconfirmed_mappings().await?;
            print_json(&mappings)?;
        }
        Commands::Migrate { ledger } => {
            app.migrate(ledger).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
