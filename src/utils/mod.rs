use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use which::which;

/// Resolves the dump executable: an explicit path must exist, a bare name is
/// looked up in PATH.
pub fn find_executable(explicit: Option<&Path>, default_name: &str) -> Result<PathBuf> {
    match explicit {
        Some(path) if path.components().count() > 1 => {
            if path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(anyhow::anyhow!("{} does not exist or is not a file", path.display()))
            }
        }
        Some(name) => which(name)
            .with_context(|| format!("{} executable not found in PATH", name.display())),
        None => which(default_name).with_context(|| {
            format!(
                "{} executable not found in PATH. Please ensure the MySQL client tools \
                 are installed and in your PATH.",
                default_name
            )
        }),
    }
}

pub fn date_stamp(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_stamp_is_compact() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(date_stamp(date), "20240115");
    }

    #[test]
    fn test_explicit_missing_executable_is_an_error() {
        let result = find_executable(Some(Path::new("/nonexistent/bin/mysqldump")), "mysqldump");
        assert!(result.is_err());
    }

    #[test]
    fn test_explicit_existing_executable_is_used() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let bin = dir.path().join("dump");
        std::fs::write(&bin, "#!/bin/sh\n")?;
        assert_eq!(find_executable(Some(&bin), "mysqldump")?, bin);
        Ok(())
    }
}
