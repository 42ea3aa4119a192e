//! Website Backup Tool
//!
//! Archives each site's files and database and ships them to S3 under a
//! daily, monthly or yearly retention folder.

// sitebackup/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use backup::{CleanupStatus, RunReport, SiteStatus};
use config::cli::CliArgs;
use config::{BackupConfig, RawJsonConfig};

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit with status 2 from here.
    let args = CliArgs::parse();
    // A missing .env is fine; credentials may come from the environment.
    dotenv::dotenv().ok();
    init_tracing(args.verbose);

    match run_app(args).await {
        Ok(report) => {
            summarize(&report);
            if report.has_failures() {
                ExitCode::FAILURE
            } else {
                info!("✅ Backup completed successfully.");
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("❌ Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "info,sitebackup=debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_app(args: CliArgs) -> Result<RunReport> {
    let raw_config = RawJsonConfig::load_from_json(&args.config)
        .context(format!("Failed to load settings from {}", args.config.display()))?;
    let today = chrono::Local::now().date_naive();
    let config = BackupConfig::from_sources(&args, &raw_config, today)
        .context("Invalid backup configuration")?;

    backup::run_backup_flow(Arc::new(config))
        .await
        .context("Backup process failed")
}

fn summarize(report: &RunReport) {
    let failed: Vec<_> = report.failed().collect();
    info!(
        "{} site(s) backed up, {} failed",
        report.succeeded_count(),
        failed.len()
    );
    for outcome in failed {
        if let SiteStatus::Failed { stage, error } = &outcome.status {
            error!("Site '{}' failed at {}: {}", outcome.site, stage, error);
        }
        if outcome.cleanup == CleanupStatus::ArchiveRetained {
            warn!(
                "Archive for '{}' was kept locally because it was not uploaded",
                outcome.site
            );
        }
    }
}
