use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Pipeline stage a site's backup can fail in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Staging,
    Archive,
    Upload,
    Tag,
    /// The site's task died before reporting a result.
    Internal,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Staging => "staging",
            Stage::Archive => "archive",
            Stage::Upload => "upload",
            Stage::Tag => "tag",
            Stage::Internal => "internal",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Website '{site}' not found in {}", .root.display())]
    SiteNotFound { site: String, root: PathBuf },

    #[error("Database credentials incomplete, missing: {}", .missing.join(", "))]
    CredentialsIncomplete { missing: Vec<&'static str> },

    #[error("Database dump of '{database}' failed: {reason}")]
    DumpFailed { database: String, reason: String },

    #[error("Failed to copy {} into staging: {reason}", .path.display())]
    CopyFailed { path: PathBuf, reason: String },

    #[error("Failed to create archive {}: {reason}", .path.display())]
    ArchiveFailed { path: PathBuf, reason: String },

    #[error("Upload to s3://{bucket}/{key} failed: {reason}")]
    UploadFailed {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("Tagging s3://{bucket}/{key} failed: {reason}")]
    TagFailed {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("Backup task failed: {0}")]
    TaskFailed(String),
}

impl BackupError {
    /// Stage a fatal per-site error is recorded against.
    pub fn stage(&self) -> Stage {
        match self {
            BackupError::CopyFailed { .. } => Stage::Staging,
            BackupError::UploadFailed { .. } => Stage::Upload,
            BackupError::TagFailed { .. } => Stage::Tag,
            BackupError::TaskFailed(_) => Stage::Internal,
            // Recoverable variants never reach the orchestrator as fatal;
            // anything else happened while assembling the archive.
            _ => Stage::Archive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_map_to_their_stage() {
        let copy = BackupError::CopyFailed {
            path: PathBuf::from("/var/www/blog/x"),
            reason: "denied".into(),
        };
        let tag = BackupError::TagFailed {
            bucket: "blog".into(),
            key: "monthly/blog-20240115.tar.gz".into(),
            reason: "boom".into(),
        };
        assert_eq!(copy.stage(), Stage::Staging);
        assert_eq!(tag.stage(), Stage::Tag);
        assert_eq!(tag.stage().to_string(), "tag");
    }

    #[test]
    fn incomplete_credentials_lists_missing_fields() {
        let err = BackupError::CredentialsIncomplete {
            missing: vec!["DB_USER", "DB_PASSWORD"],
        };
        assert_eq!(
            err.to_string(),
            "Database credentials incomplete, missing: DB_USER, DB_PASSWORD"
        );
    }
}
