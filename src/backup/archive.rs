// sitebackup/src/backup/archive.rs
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::backup::credentials::extract_credentials;
use crate::backup::db_dump::dump_database;
use crate::backup::logic::Site;
use crate::backup::staging::{copy_tree, prepare_workspace};
use crate::config::BackupConfig;
use crate::errors::BackupError;

pub fn archive_file_name(site: &str, date_stamp: &str) -> String {
    format!("{}-{}.tar.gz", site, date_stamp)
}

pub fn dump_file_name(site: &str, date_stamp: &str) -> String {
    format!("{}-{}.sql", site, date_stamp)
}

/// Every local path a site's backup may create during one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub workspace: PathBuf,
    pub dump: PathBuf,
    pub archive: PathBuf,
}

impl ArtifactPaths {
    pub fn for_site(backup_dir: &Path, site: &str, date_stamp: &str) -> Self {
        ArtifactPaths {
            workspace: backup_dir.join(site),
            dump: backup_dir.join(dump_file_name(site, date_stamp)),
            archive: backup_dir.join(archive_file_name(site, date_stamp)),
        }
    }
}

/// Result of a successful archive build.
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub archive_path: PathBuf,
    /// Whether a database dump made it into the archive.
    pub database_included: bool,
}

fn archive_failed(path: &Path, reason: impl ToString) -> BackupError {
    BackupError::ArchiveFailed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Writes `archive_dest_path` as a gzipped tar holding `workspace` under the
/// top-level directory `site_name` and, if given, the dump as a sibling file.
///
/// Entries are added in sorted order so rebuilding from the same workspace
/// yields the same member list.
pub fn create_site_archive(
    workspace: &Path,
    site_name: &str,
    dump_file: Option<&Path>,
    archive_dest_path: &Path,
) -> Result<PathBuf, BackupError> {
    if !workspace.is_dir() {
        return Err(archive_failed(
            archive_dest_path,
            format!("staging workspace {} is not a directory", workspace.display()),
        ));
    }

    debug!(
        "Creating {} from {}",
        archive_dest_path.display(),
        workspace.display()
    );

    let result = write_archive(workspace, site_name, dump_file, archive_dest_path);
    if result.is_err() && archive_dest_path.exists() {
        if let Err(e) = fs::remove_file(archive_dest_path) {
            warn!(
                "Failed to remove partial archive {}: {}",
                archive_dest_path.display(),
                e
            );
        }
    }
    result.map_err(|e| archive_failed(archive_dest_path, e))?;

    debug!("✓ Archive created at {}", archive_dest_path.display());
    Ok(archive_dest_path.to_path_buf())
}

fn write_archive(
    workspace: &Path,
    site_name: &str,
    dump_file: Option<&Path>,
    archive_dest_path: &Path,
) -> std::io::Result<()> {
    let archive_file = File::create(archive_dest_path)?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);
    let root = Path::new(site_name);

    for entry in WalkDir::new(workspace).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let path = entry.path();
        let relative = path
            .strip_prefix(workspace)
            .map_err(std::io::Error::other)?;
        let name = root.join(relative);

        if entry.file_type().is_dir() {
            tar_builder.append_dir(&name, path)?;
        } else {
            tar_builder.append_path_with_name(path, &name)?;
        }
    }

    if let Some(dump) = dump_file {
        let member = dump
            .file_name()
            .ok_or_else(|| std::io::Error::other("dump path has no file name"))?;
        tar_builder.append_path_with_name(dump, member)?;
    }

    let encoder = tar_builder.into_inner()?;
    let archive_file = encoder.finish()?;
    archive_file.sync_all()
}

/// Stages a site, dumps its database when it has one, and packs both into
/// the run's archive.
///
/// Copy failures and archive write failures are fatal for the site; a
/// missing config or a failed dump only drops the database member.
pub async fn build_site_archive(
    config: &BackupConfig,
    site: &Site,
) -> Result<BuiltArchive, BackupError> {
    let paths = ArtifactPaths::for_site(&config.backup_dir, &site.name, &config.date_stamp());

    let source_dir = site.source_dir.clone();
    let workspace = paths.workspace.clone();
    tokio::task::spawn_blocking(move || {
        prepare_workspace(&workspace)?;
        copy_tree(&source_dir, &workspace)
    })
    .await
    .map_err(|e| BackupError::CopyFailed {
        path: site.source_dir.clone(),
        reason: format!("copy task failed: {}", e),
    })??;

    let dump_path = match extract_credentials(&site.source_dir) {
        Some(credentials) => match dump_database(&config.dump, &credentials, &paths.dump).await {
            Ok(path) => {
                debug!("{} created", path.display());
                Some(path)
            }
            Err(e) => {
                warn!(site = %site.name, "{}; archiving files only", e);
                None
            }
        },
        None => {
            debug!(site = %site.name, "Database file not created");
            None
        }
    };

    let workspace = paths.workspace.clone();
    let archive_path = paths.archive.clone();
    let site_name = site.name.clone();
    let dump_for_archive = dump_path.clone();
    let archive_path = tokio::task::spawn_blocking(move || {
        create_site_archive(
            &workspace,
            &site_name,
            dump_for_archive.as_deref(),
            &archive_path,
        )
    })
    .await
    .map_err(|e| archive_failed(&paths.archive, format!("archive task failed: {}", e)))??;

    Ok(BuiltArchive {
        archive_path,
        database_included: dump_path.is_some(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use std::io::Read;

    /// Reads every member of a `.tar.gz` into `name -> contents`
    /// (directories map to `None`).
    pub(crate) fn read_archive(path: &Path) -> BTreeMap<String, Option<String>> {
        let file = File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut members = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
            if entry.header().entry_type().is_dir() {
                members.insert(name, None);
            } else {
                let mut contents = String::new();
                entry.read_to_string(&mut contents).unwrap();
                members.insert(name, Some(contents));
            }
        }
        members
    }

    #[test]
    fn test_artifact_names_are_deterministic() {
        assert_eq!(archive_file_name("blog", "20240115"), "blog-20240115.tar.gz");
        let paths = ArtifactPaths::for_site(Path::new("/backups"), "blog", "20240115");
        assert_eq!(paths.workspace, PathBuf::from("/backups/blog"));
        assert_eq!(paths.dump, PathBuf::from("/backups/blog-20240115.sql"));
        assert_eq!(paths.archive, PathBuf::from("/backups/blog-20240115.tar.gz"));
    }

    #[test]
    fn test_archive_layout_with_dump() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let workspace = dir.path().join("shop");
        fs::create_dir_all(workspace.join("css"))?;
        fs::write(workspace.join("index.html"), "hello")?;
        fs::write(workspace.join("css/site.css"), "body{}")?;
        let dump = dir.path().join("shop-20240115.sql");
        fs::write(&dump, "CREATE TABLE t;")?;
        let dest = dir.path().join("shop-20240115.tar.gz");

        create_site_archive(&workspace, "shop", Some(&dump), &dest)?;

        let members = read_archive(&dest);
        assert_eq!(members.get("shop"), Some(&None));
        assert_eq!(members.get("shop/index.html"), Some(&Some("hello".to_string())));
        assert_eq!(members.get("shop/css/site.css"), Some(&Some("body{}".to_string())));
        assert_eq!(
            members.get("shop-20240115.sql"),
            Some(&Some("CREATE TABLE t;".to_string()))
        );
        Ok(())
    }

    #[test]
    fn test_archive_without_dump_has_only_site_tree() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let workspace = dir.path().join("blog");
        fs::create_dir_all(&workspace)?;
        fs::write(workspace.join("index.html"), "hi")?;
        let dest = dir.path().join("blog-20240115.tar.gz");

        create_site_archive(&workspace, "blog", None, &dest)?;

        let members = read_archive(&dest);
        assert!(members.keys().all(|name| name == "blog" || name.starts_with("blog/")));
        Ok(())
    }

    #[test]
    fn test_unwritable_destination_is_archive_failed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let workspace = dir.path().join("blog");
        fs::create_dir_all(&workspace)?;
        let dest = dir.path().join("missing-dir/blog-20240115.tar.gz");

        let result = create_site_archive(&workspace, "blog", None, &dest);
        assert!(matches!(result, Err(BackupError::ArchiveFailed { .. })));
        Ok(())
    }
}
