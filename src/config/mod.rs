// sitebackup/src/config/mod.rs
pub mod cli;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use cli::{CliArgs, DEFAULT_BACKUP_DIR, DEFAULT_ROOT_DIR};

/// Bucket used when neither `--bucket` nor a site-named bucket applies.
pub const DEFAULT_BUCKET: &str = "misc-sites";

const DEFAULT_DUMP_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_UPLOAD_ATTEMPTS: u32 = 3;
const DEFAULT_UPLOAD_BACKOFF_MS: u64 = 500;
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 15 * 60;

/// Retention folder a run stores its archives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetentionCategory {
    Daily,
    Monthly,
    Yearly,
}

impl RetentionCategory {
    pub const TAG_KEY: &'static str = "frequency";

    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionCategory::Daily => "daily",
            RetentionCategory::Monthly => "monthly",
            RetentionCategory::Yearly => "yearly",
        }
    }

    /// The object tag applied to every uploaded archive.
    pub fn tag(&self) -> (&'static str, &'static str) {
        (Self::TAG_KEY, self.as_str())
    }
}

impl fmt::Display for RetentionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(RetentionCategory::Daily),
            "monthly" => Ok(RetentionCategory::Monthly),
            "yearly" => Ok(RetentionCategory::Yearly),
            other => Err(anyhow::anyhow!(
                "unknown retention category '{}', expected daily, monthly or yearly",
                other
            )),
        }
    }
}

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JsonS3StorageConfig {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub default_bucket: Option<String>,
    pub force_path_style: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JsonDumpOptions {
    pub binary: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JsonUploadOptions {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawJsonConfig {
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub dump: Option<JsonDumpOptions>,
    pub upload: Option<JsonUploadOptions>,
    pub concurrency: Option<usize>,
}

impl RawJsonConfig {
    /// Reads `config_path`; a missing file yields the defaults.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(RawJsonConfig::default());
        }
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3StorageConfig {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub static_credentials: Option<(String, String)>,
    pub force_path_style: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSettings {
    /// Explicit dump executable; `mysqldump` from PATH otherwise.
    pub binary: Option<PathBuf>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSettings {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub attempt_timeout: Duration,
}

/// Immutable settings for one backup run, built once at start-up.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub retention: RetentionCategory,
    pub root_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub bucket: Option<String>,
    pub default_bucket: String,
    pub site: Option<String>,
    pub cleanup: bool,
    pub run_date: NaiveDate,
    pub concurrency: usize,
    pub dump: DumpSettings,
    pub upload: UploadSettings,
    pub s3: S3StorageConfig,
}

impl BackupConfig {
    /// Builds a config with the documented defaults, used as the base for
    /// both the CLI path and tests.
    pub fn new(retention: RetentionCategory, run_date: NaiveDate) -> Self {
        BackupConfig {
            retention,
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            bucket: None,
            default_bucket: DEFAULT_BUCKET.to_string(),
            site: None,
            cleanup: false,
            run_date,
            concurrency: 1,
            dump: DumpSettings {
                binary: None,
                timeout: Duration::from_secs(DEFAULT_DUMP_TIMEOUT_SECS),
            },
            upload: UploadSettings {
                max_attempts: DEFAULT_UPLOAD_ATTEMPTS,
                initial_backoff: Duration::from_millis(DEFAULT_UPLOAD_BACKOFF_MS),
                attempt_timeout: Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_SECS),
            },
            s3: S3StorageConfig::default(),
        }
    }

    /// Merges the command line over `config.json` values.
    pub fn from_sources(args: &CliArgs, raw: &RawJsonConfig, run_date: NaiveDate) -> Result<Self> {
        let mut config = BackupConfig::new(args.retention(), run_date);

        if let Some(root) = &args.root_directory {
            config.root_dir = root.clone();
        }
        if let Some(backup) = &args.backup_directory {
            config.backup_dir = backup.clone();
        }
        if config.backup_dir.as_os_str().is_empty() {
            anyhow::bail!("backup directory cannot be empty");
        }
        config.bucket = args.bucket.clone().filter(|b| !b.trim().is_empty());
        config.site = args.site.clone().filter(|s| !s.trim().is_empty());
        config.cleanup = args.cleanup;

        config.concurrency = args.jobs.or(raw.concurrency).unwrap_or(1);
        if config.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }

        if let Some(dump) = &raw.dump {
            config.dump.binary = dump.binary.clone();
            if let Some(secs) = dump.timeout_secs {
                config.dump.timeout = Duration::from_secs(secs);
            }
        }

        if let Some(upload) = &raw.upload {
            if let Some(attempts) = upload.max_attempts {
                if attempts == 0 {
                    anyhow::bail!("upload.max_attempts must be at least 1");
                }
                config.upload.max_attempts = attempts;
            }
            if let Some(ms) = upload.initial_backoff_ms {
                config.upload.initial_backoff = Duration::from_millis(ms);
            }
            if let Some(secs) = upload.timeout_secs {
                config.upload.attempt_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(s3_raw) = &raw.s3_storage {
            config.s3 = parse_s3_storage(s3_raw)?;
            if let Some(bucket) = s3_raw.default_bucket.as_ref().filter(|b| !b.is_empty()) {
                config.default_bucket = bucket.clone();
            }
        }

        Ok(config)
    }

    /// `YYYYMMDD` stamp used in every artifact name of this run.
    pub fn date_stamp(&self) -> String {
        crate::utils::date_stamp(self.run_date)
    }
}

fn parse_s3_storage(s3_raw: &JsonS3StorageConfig) -> Result<S3StorageConfig> {
    let endpoint_url = match s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()) {
        Some(endpoint) => {
            url::Url::parse(endpoint)
                .with_context(|| format!("Invalid s3_storage.endpoint_url: {}", endpoint))?;
            Some(endpoint.clone())
        }
        None => None,
    };

    let static_credentials = match (
        s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
        s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
    ) {
        (Some(key_id), Some(secret)) => Some((key_id.clone(), secret.clone())),
        (None, None) => None,
        _ => {
            tracing::warn!(
                "s3_storage has only one of access_key_id/secret_access_key; \
                 falling back to the default AWS credential chain"
            );
            None
        }
    };

    Ok(S3StorageConfig {
        region: s3_raw.region.clone().filter(|s| !s.is_empty()),
        endpoint_url,
        static_credentials,
        force_path_style: s3_raw.force_path_style.unwrap_or(false),
    })
}
