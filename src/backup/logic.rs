// sitebackup/src/backup/logic.rs
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::backup::archive::{ArtifactPaths, build_site_archive};
use crate::backup::s3_upload::{ObjectStore, RemoteUploader, UploadTarget};
use crate::config::BackupConfig;
use crate::errors::{BackupError, Stage};

/// A website directory found under the root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub name: String,
    pub source_dir: PathBuf,
}

/// What happened to a site's local artifacts after its pipeline finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStatus {
    /// Cleanup wasn't requested; everything is left for inspection.
    Retained,
    CleanedUp,
    /// Staging was removed but the archive was kept because it never
    /// reached remote storage.
    ArchiveRetained,
    /// Some artifact could not be removed.
    Incomplete,
}

#[derive(Debug)]
pub enum SiteStatus {
    Uploaded {
        archive: PathBuf,
        target: UploadTarget,
        database_included: bool,
    },
    Failed {
        stage: Stage,
        error: BackupError,
    },
}

#[derive(Debug)]
pub struct SiteOutcome {
    pub site: String,
    pub status: SiteStatus,
    pub cleanup: CleanupStatus,
}

impl SiteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, SiteStatus::Uploaded { .. })
    }
}

/// Per-site outcomes of one run, in discovery order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<SiteOutcome>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|o| !o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &SiteOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }
}

/// Lists the site directories under `root_dir`, sorted by name.
///
/// `staging_dir` (already resolved with [`resolve_path`]) is skipped when it
/// sits directly under the root, so the backup directory is never a site.
pub fn discover_sites(
    root_dir: &Path,
    staging_dir: Option<&Path>,
) -> Result<Vec<Site>, BackupError> {
    let entries = fs::read_dir(root_dir).map_err(|e| {
        BackupError::Config(format!(
            "cannot read root directory {}: {}",
            root_dir.display(),
            e
        ))
    })?;

    let mut sites = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if staging_dir.is_some_and(|dir| resolve_path(&path).is_ok_and(|p| p == dir)) {
            debug!("Skipping backup directory {}", path.display());
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => sites.push(Site {
                name,
                source_dir: path,
            }),
            Err(name) => warn!("Skipping site directory with non UTF-8 name: {:?}", name),
        }
    }
    sites.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(sites)
}

/// Narrows the discovered sites to `only` when given, which must exist.
fn select_sites(
    sites: Vec<Site>,
    only: Option<&str>,
    root_dir: &Path,
) -> Result<Vec<Site>, BackupError> {
    match only {
        Some(wanted) => sites
            .into_iter()
            .find(|site| site.name == wanted)
            .map(|site| vec![site])
            .ok_or_else(|| BackupError::SiteNotFound {
                site: wanted.to_string(),
                root: root_dir.to_path_buf(),
            }),
        None => Ok(sites),
    }
}

/// Canonical form of `path`, which need not exist yet: the deepest existing
/// ancestor is canonicalized and the missing components are appended.
fn resolve_path(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                return Ok(missing
                    .into_iter()
                    .rev()
                    .fold(canonical, |acc: PathBuf, name| acc.join(name)));
            }
            Err(e) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name.to_os_string());
                    existing = parent;
                }
                _ => return Err(e),
            },
        }
    }
}

/// Rejects a backup directory whose staging workspaces could overwrite site
/// sources. Both paths must already be resolved.
fn check_backup_dir(root_dir: &Path, backup_dir: &Path, sites: &[Site]) -> Result<(), BackupError> {
    if backup_dir == root_dir {
        return Err(BackupError::Config(format!(
            "backup directory {} is the root directory",
            backup_dir.display()
        )));
    }
    for site in sites {
        let source = resolve_path(&site.source_dir)?;
        if backup_dir.starts_with(&source) {
            return Err(BackupError::Config(format!(
                "backup directory {} lies inside site '{}'",
                backup_dir.display(),
                site.name
            )));
        }
        if root_dir.starts_with(backup_dir.join(&site.name)) {
            return Err(BackupError::Config(format!(
                "staging workspace for '{}' would contain the root directory {}",
                site.name,
                root_dir.display()
            )));
        }
    }
    Ok(())
}

async fn remove_artifact(path: &Path) -> bool {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            debug!("Removed {}", path.display());
            true
        }
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}

/// Removes the artifacts this run created for a site.
///
/// The archive is only removed once it is safely stored remotely; a failed
/// upload keeps it as the only copy.
async fn cleanup_site(paths: &ArtifactPaths, uploaded: bool) -> CleanupStatus {
    let mut complete = remove_artifact(&paths.workspace).await;
    complete &= remove_artifact(&paths.dump).await;

    if !uploaded {
        if paths.archive.exists() {
            warn!(
                "Keeping {} because it was not uploaded",
                paths.archive.display()
            );
            return if complete {
                CleanupStatus::ArchiveRetained
            } else {
                CleanupStatus::Incomplete
            };
        }
    } else {
        complete &= remove_artifact(&paths.archive).await;
    }

    if complete {
        CleanupStatus::CleanedUp
    } else {
        CleanupStatus::Incomplete
    }
}

/// Runs the full pipeline for one site and always reports an outcome.
async fn process_site(
    config: &BackupConfig,
    uploader: &RemoteUploader,
    site: &Site,
) -> SiteOutcome {
    debug!("Backing up website: '{}'", site.name);

    let pipeline = async {
        let built = build_site_archive(config, site).await?;
        debug!("Uploading {} to s3...", built.archive_path.display());
        let target = uploader
            .upload(&built.archive_path, &site.name, config.retention)
            .await?;
        Ok::<_, BackupError>((built, target))
    };

    let status = match pipeline.await {
        Ok((built, target)) => SiteStatus::Uploaded {
            archive: built.archive_path,
            target,
            database_included: built.database_included,
        },
        Err(error) => SiteStatus::Failed {
            stage: error.stage(),
            error,
        },
    };

    let cleanup = if config.cleanup {
        let paths =
            ArtifactPaths::for_site(&config.backup_dir, &site.name, &config.date_stamp());
        cleanup_site(&paths, matches!(status, SiteStatus::Uploaded { .. })).await
    } else {
        CleanupStatus::Retained
    };

    SiteOutcome {
        site: site.name.clone(),
        status,
        cleanup,
    }
}

fn log_outcome(outcome: &SiteOutcome) {
    match &outcome.status {
        SiteStatus::Uploaded {
            archive,
            target,
            database_included,
        } => info!(
            site = %outcome.site,
            archive = %archive.display(),
            database = *database_included,
            cleanup = ?outcome.cleanup,
            "✓ Backed up to s3://{}/{}",
            target.bucket,
            target.key
        ),
        SiteStatus::Failed { stage, error } => error!(
            site = %outcome.site,
            cleanup = ?outcome.cleanup,
            "❌ Backup failed at {} stage: {}",
            stage,
            error
        ),
    }
}

/// Backs up every selected site and collects their outcomes.
///
/// Only pre-run problems (unknown `--site`, unreadable root, a backup
/// directory that overlaps the sites or cannot be created) are returned as
/// errors; per-site failures land in the report.
pub async fn perform_backup_orchestration(
    config: Arc<BackupConfig>,
    store: Arc<dyn ObjectStore>,
) -> Result<RunReport, BackupError> {
    let root_dir = resolve_path(&config.root_dir).map_err(|e| {
        BackupError::Config(format!(
            "cannot resolve root directory {}: {}",
            config.root_dir.display(),
            e
        ))
    })?;
    let backup_dir = resolve_path(&config.backup_dir).map_err(|e| {
        BackupError::Config(format!(
            "cannot resolve backup directory {}: {}",
            config.backup_dir.display(),
            e
        ))
    })?;
    let discovered = discover_sites(&config.root_dir, Some(backup_dir.as_path()))?;
    check_backup_dir(&root_dir, &backup_dir, &discovered)?;
    let sites = select_sites(discovered, config.site.as_deref(), &config.root_dir)?;
    fs::create_dir_all(&config.backup_dir).map_err(|e| {
        BackupError::Config(format!(
            "cannot create backup directory {}: {}",
            config.backup_dir.display(),
            e
        ))
    })?;

    info!(
        "🚀 Backing up {} site(s) from {} ({} retention)",
        sites.len(),
        config.root_dir.display(),
        config.retention
    );

    let uploader = Arc::new(RemoteUploader::new(store, &config));
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut task_sites = HashMap::new();

    for (index, site) in sites.iter().cloned().enumerate() {
        let config = Arc::clone(&config);
        let uploader = Arc::clone(&uploader);
        let permits = Arc::clone(&permits);
        let span = info_span!("site", name = %site.name);
        let handle = tasks.spawn(
            async move {
                // The semaphore is never closed, so acquire only fails if it were.
                let _permit = permits.acquire_owned().await.ok();
                (index, process_site(&config, &uploader, &site).await)
            }
            .instrument(span),
        );
        task_sites.insert(handle.id(), index);
    }

    let mut slots: Vec<Option<SiteOutcome>> = sites.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, outcome)) => {
                log_outcome(&outcome);
                slots[index] = Some(outcome);
            }
            Err(join_error) => {
                let Some(&index) = task_sites.get(&join_error.id()) else {
                    error!("Backup task failed: {}", join_error);
                    continue;
                };
                let site = &sites[index];
                let cleanup = if config.cleanup {
                    let paths = ArtifactPaths::for_site(
                        &config.backup_dir,
                        &site.name,
                        &config.date_stamp(),
                    );
                    cleanup_site(&paths, false).await
                } else {
                    CleanupStatus::Retained
                };
                let outcome = SiteOutcome {
                    site: site.name.clone(),
                    status: SiteStatus::Failed {
                        stage: Stage::Internal,
                        error: BackupError::TaskFailed(join_error.to_string()),
                    },
                    cleanup,
                };
                log_outcome(&outcome);
                slots[index] = Some(outcome);
            }
        }
    }

    Ok(RunReport {
        outcomes: slots.into_iter().flatten().collect(),
    })
}
