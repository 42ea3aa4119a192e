mod logic;
pub(crate) mod archive;
pub(crate) mod credentials;
pub(crate) mod db_dump;
pub(crate) mod s3_upload;
pub(crate) mod staging;

use anyhow::Result;
use std::sync::Arc;

use crate::config::BackupConfig;
use s3_upload::S3ObjectStore;

pub use logic::{CleanupStatus, RunReport, SiteStatus};

/// Public entry point for the backup process.
/// Connects to S3 and backs up every selected site.
pub async fn run_backup_flow(config: Arc<BackupConfig>) -> Result<RunReport> {
    let store = Arc::new(S3ObjectStore::new(&config.s3).await);
    let report = logic::perform_backup_orchestration(config, store).await?;
    Ok(report)
}
