use anyhow::{bail, Context, Result};
use backup_core::lock::RunningOperation;
use backup_core::paths::StorageKind;
use backup_core::{
    BackupManager, BackupSettings, Chain, NoCheckpoint, RestoreState, SnapshotRequest, Trigger, VerifyDepth,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "casefile-backup")]
#[command(author, version, about = "Casefile backup and restore", long_about = None)]
struct Cli {
    /// Settings file (defaults to the platform config dir, or CASEFILE_BACKUP_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the data file and attachments
    #[arg(long, global = true)]
    live_root: Option<PathBuf>,

    /// Directory holding archives and the catalog
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List backup points grouped by chain, newest chain first
    List,

    /// Back up now
    Create {
        /// Start a new full chain even if an incremental would do
        #[arg(long)]
        force: bool,
        #[arg(long, value_enum, default_value = "manual")]
        trigger: TriggerArg,
    },

    /// Delete a backup point
    Delete {
        id: String,
        /// Also delete the incrementals that depend on it
        #[arg(long)]
        cascade: bool,
    },

    /// Check a backup point's archive
    Verify {
        id: String,
        /// Rehash every file in the archive, not just the checksum
        #[arg(long)]
        deep: bool,
    },

    /// Stage a restore; it is applied by `apply` at the next start
    Restore { id: String },

    /// Cancel a prepared restore
    Cancel,

    /// Show the pending restore and catalog summary
    Status,

    /// Apply (or resume) a pending restore
    Apply,

    /// Remove backups outside the retention policy
    Retention,

    /// Run the login hook: count the login, back up if due, run retention
    Login,

    /// Show recent backup history
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TriggerArg {
    Manual,
    Login,
    Logout,
    IdleTimeout,
}

impl From<TriggerArg> for Trigger {
    fn from(arg: TriggerArg) -> Self {
        match arg {
            TriggerArg::Manual => Trigger::Manual,
            TriggerArg::Login => Trigger::Login,
            TriggerArg::Logout => Trigger::Logout,
            TriggerArg::IdleTimeout => Trigger::IdleTimeout,
        }
    }
}

#[derive(Serialize)]
struct PointSummary {
    id: String,
    kind: String,
    parent_id: Option<String>,
    created_at: DateTime<Utc>,
    display_name: String,
    files: usize,
    tombstones: usize,
    skipped: usize,
    archive_bytes: u64,
}

#[derive(Serialize)]
struct ChainSummary {
    chain_id: String,
    safety: bool,
    points: Vec<PointSummary>,
}

impl From<&Chain> for ChainSummary {
    fn from(chain: &Chain) -> Self {
        Self {
            chain_id: chain.chain_id.clone(),
            safety: chain.is_safety(),
            points: chain
                .points
                .iter()
                .map(|p| PointSummary {
                    id: p.id.clone(),
                    kind: p.kind.to_string(),
                    parent_id: p.parent_id.clone(),
                    created_at: p.created_at,
                    display_name: p.display_name.clone(),
                    files: p.manifest.len(),
                    tombstones: p.tombstones.len(),
                    skipped: p.skipped.len(),
                    archive_bytes: p.archive.size,
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct StatusReport {
    checked_at: DateTime<Utc>,
    chains: usize,
    points: usize,
    storage: StorageKind,
    running: Option<RunningOperation>,
    restore: Option<RestoreState>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<BackupSettings> {
    let mut settings = match &cli.config {
        Some(path) => BackupSettings::load(path)
            .with_context(|| format!("cannot load settings from {}", path.display()))?,
        None => BackupSettings::load_default().context("cannot load default settings")?,
    };
    if let Some(root) = &cli.live_root {
        settings.live_root = Some(root.clone());
    }
    if let Some(dir) = &cli.backup_dir {
        settings.backup_dir = Some(dir.clone());
    }
    Ok(settings)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    debug!(?settings, "settings loaded");
    let manager = BackupManager::open(settings, Arc::new(NoCheckpoint)).context("cannot open backup store")?;

    match cli.command {
        Commands::List => {
            let chains: Vec<ChainSummary> = manager.list_points().iter().map(ChainSummary::from).collect();
            print_json(&chains)?;
        }
        Commands::Create { force, trigger } => {
            let request = SnapshotRequest {
                trigger: trigger.into(),
                force_full: force,
            };
            let outcome = manager.create_snapshot(request)?;
            print_json(&outcome)?;
        }
        Commands::Delete { id, cascade } => {
            let removal = manager.delete_point(&id, cascade)?;
            print_json(&serde_json::json!({
                "removed": removal.all().map(|p| &p.id).collect::<Vec<_>>(),
                "warning": removal.warning(),
            }))?;
        }
        Commands::Verify { id, deep } => {
            let depth = if deep { VerifyDepth::Deep } else { VerifyDepth::Checksum };
            let result = manager.verify_point(&id, depth)?;
            print_json(&result)?;
            if !result.ok {
                bail!("backup {id} failed verification");
            }
        }
        Commands::Restore { id } => {
            let state = manager.prepare_restore(&id)?;
            info!(target = %state.target_point_id, "restore staged");
            print_json(&state)?;
        }
        Commands::Cancel => {
            let state = manager.cancel_restore()?;
            print_json(&serde_json::json!({ "cancelled": state.target_point_id }))?;
        }
        Commands::Status => {
            let chains = manager.list_points();
            let report = StatusReport {
                checked_at: Utc::now(),
                chains: chains.len(),
                points: chains.iter().map(|c| c.len()).sum(),
                storage: manager.storage_kind().clone(),
                running: manager.lock().current(),
                restore: manager.restore_state()?,
            };
            print_json(&report)?;
        }
        Commands::Apply => {
            let outcome = manager.apply_pending_restore()?;
            print_json(&outcome)?;
        }
        Commands::Retention => {
            let report = manager.enforce_retention()?;
            print_json(&serde_json::json!({
                "removed": report
                    .removed
                    .iter()
                    .flat_map(|r| r.all().map(|p| p.id.clone()))
                    .collect::<Vec<_>>(),
                "kept_chains": report.kept_chains,
            }))?;
        }
        Commands::Login => {
            let outcome = manager.on_lifecycle(Trigger::Login)?;
            print_json(&serde_json::json!({ "backup": outcome }))?;
        }
        Commands::History { limit } => {
            let entries = manager.history(Some(limit))?;
            print_json(&entries)?;
        }
    }
    Ok(())
}
