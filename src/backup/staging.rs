// sitebackup/src/backup/staging.rs
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::BackupError;

fn copy_failed(path: &Path, reason: impl ToString) -> BackupError {
    BackupError::CopyFailed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Removes any leftovers from a previous run and recreates `workspace` empty.
pub fn prepare_workspace(workspace: &Path) -> Result<(), BackupError> {
    if workspace.symlink_metadata().is_ok() {
        debug!("Removing stale staging workspace {}", workspace.display());
        let removed = if workspace.is_dir() && !workspace.is_symlink() {
            fs::remove_dir_all(workspace)
        } else {
            fs::remove_file(workspace)
        };
        removed.map_err(|e| copy_failed(workspace, e))?;
    }
    fs::create_dir_all(workspace).map_err(|e| copy_failed(workspace, e))
}

/// Recursively copies `source_dir` into `workspace`, following symlinks.
///
/// Any unreadable entry (permissions, dangling or looping symlink) fails the
/// whole copy: a partial tree can't be archived as a valid backup.
/// Returns the number of files copied.
pub fn copy_tree(source_dir: &Path, workspace: &Path) -> Result<u64, BackupError> {
    if !source_dir.is_dir() {
        return Err(copy_failed(source_dir, "source is not a directory"));
    }

    let mut files_copied = 0;
    for entry in WalkDir::new(source_dir).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| source_dir.to_path_buf());
            copy_failed(&path, e)
        })?;
        let path = entry.path();
        let relative = path
            .strip_prefix(source_dir)
            .map_err(|e| copy_failed(path, e))?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let target: PathBuf = workspace.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| copy_failed(path, e))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| copy_failed(path, e))?;
            }
            fs::copy(path, &target).map_err(|e| copy_failed(path, e))?;
            files_copied += 1;
        }
    }

    debug!(
        "{} copied into {} ({} files)",
        source_dir.display(),
        workspace.display(),
        files_copied
    );
    Ok(files_copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_site(root: &Path) -> PathBuf {
        let site = root.join("blog");
        fs::create_dir_all(site.join("wp-content/uploads")).unwrap();
        fs::write(site.join("index.php"), "<?php echo 'hi';").unwrap();
        fs::write(site.join("wp-content/uploads/a.txt"), "a").unwrap();
        fs::create_dir_all(site.join("empty")).unwrap();
        site
    }

    #[test]
    fn test_prepare_clears_stale_contents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let workspace = dir.path().join("blog");
        fs::create_dir_all(workspace.join("old"))?;
        fs::write(workspace.join("old/leftover.txt"), "stale")?;

        prepare_workspace(&workspace)?;
        assert!(workspace.is_dir());
        assert_eq!(fs::read_dir(&workspace)?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_copy_preserves_relative_structure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let site = sample_site(dir.path());
        let workspace = dir.path().join("staging/blog");
        prepare_workspace(&workspace)?;

        let copied = copy_tree(&site, &workspace)?;
        assert_eq!(copied, 2);
        assert_eq!(fs::read_to_string(workspace.join("wp-content/uploads/a.txt"))?, "a");
        assert!(workspace.join("index.php").is_file());
        assert!(workspace.join("empty").is_dir());
        Ok(())
    }

    #[test]
    fn test_missing_source_is_copy_failed() {
        let dir = tempfile::tempdir().unwrap();
        let result = copy_tree(&dir.path().join("nope"), &dir.path().join("ws"));
        assert!(matches!(result, Err(BackupError::CopyFailed { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_is_copy_failed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let site = sample_site(dir.path());
        std::os::unix::fs::symlink(dir.path().join("missing-target"), site.join("broken"))?;
        let workspace = dir.path().join("staging/blog");
        prepare_workspace(&workspace)?;

        match copy_tree(&site, &workspace) {
            Err(BackupError::CopyFailed { path, .. }) => assert!(path.ends_with("broken")),
            other => panic!("expected CopyFailed, got {:?}", other),
        }
        Ok(())
    }
}
