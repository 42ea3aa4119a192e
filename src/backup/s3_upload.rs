// sitebackup/src/backup/s3_upload.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{Tag, Tagging};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{BackupConfig, RetentionCategory, S3StorageConfig, UploadSettings};
use crate::errors::BackupError;

/// The object-store operations a backup run needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<String>>;

    /// Single put of the whole local file.
    async fn upload_object(&self, bucket: &str, key: &str, file_path: &Path) -> Result<()>;

    async fn put_object_tag(
        &self,
        bucket: &str,
        key: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<()>;
}

/// S3 (or S3-compatible, e.g. DigitalOcean Spaces) object store.
pub struct S3ObjectStore {
    client: s3::Client,
}

impl S3ObjectStore {
    pub async fn new(storage: &S3StorageConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
        if let Some(region) = &storage.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &storage.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some((access_key_id, secret_access_key)) = &storage.static_credentials {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                access_key_id,
                secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(storage.force_path_style)
            .build();
        S3ObjectStore {
            client: s3::Client::from_conf(s3_config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_buckets(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
            .context("ListBuckets failed")?;
        Ok(response
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    async fn upload_object(&self, bucket: &str, key: &str, file_path: &Path) -> Result<()> {
        let body = ByteStream::from_path(file_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create ByteStream from file: {}",
                    file_path.display()
                )
            })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
            .with_context(|| format!("PutObject s3://{}/{} failed", bucket, key))?;
        Ok(())
    }

    async fn put_object_tag(
        &self,
        bucket: &str,
        key: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<()> {
        let tag = Tag::builder().key(tag_key).value(tag_value).build()?;
        let tagging = Tagging::builder().tag_set(tag).build()?;

        self.client
            .put_object_tagging()
            .bucket(bucket)
            .key(key)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
            .with_context(|| format!("PutObjectTagging s3://{}/{} failed", bucket, key))?;
        Ok(())
    }
}

/// Where an archive ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub bucket: String,
    pub key: String,
}

/// Picks the destination bucket and key for a site's archive.
///
/// Precedence: explicit bucket, then a bucket named exactly like the site
/// (whose key then drops the site segment), then `default_bucket`.
pub fn resolve_upload_target(
    explicit_bucket: Option<&str>,
    available_buckets: &[String],
    default_bucket: &str,
    site: &str,
    category: RetentionCategory,
    file_name: &str,
) -> UploadTarget {
    let site_scoped_key = format!("{}/{}/{}", site, category, file_name);

    if let Some(bucket) = explicit_bucket {
        return UploadTarget {
            bucket: bucket.to_string(),
            key: site_scoped_key,
        };
    }
    if available_buckets.iter().any(|b| b == site) {
        return UploadTarget {
            bucket: site.to_string(),
            key: format!("{}/{}", category, file_name),
        };
    }
    UploadTarget {
        bucket: default_bucket.to_string(),
        key: site_scoped_key,
    }
}

/// Uploads archives and tags them with their retention category.
///
/// Shared by every site of a run; the bucket listing is fetched once.
pub struct RemoteUploader {
    store: Arc<dyn ObjectStore>,
    explicit_bucket: Option<String>,
    default_bucket: String,
    settings: UploadSettings,
    bucket_cache: OnceCell<Vec<String>>,
}

impl RemoteUploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: &BackupConfig) -> Self {
        RemoteUploader {
            store,
            explicit_bucket: config.bucket.clone(),
            default_bucket: config.default_bucket.clone(),
            settings: config.upload.clone(),
            bucket_cache: OnceCell::new(),
        }
    }

    /// Runs `op` up to `max_attempts` times with exponential backoff, each
    /// attempt bounded by the attempt timeout.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.settings.initial_backoff;
        let mut attempt = 1;
        loop {
            let error = match timeout(self.settings.attempt_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => anyhow::anyhow!(
                    "{} timed out after {} seconds",
                    operation,
                    self.settings.attempt_timeout.as_secs()
                ),
            };
            if attempt >= self.settings.max_attempts {
                return Err(error);
            }
            warn!(
                "{} attempt {}/{} failed: {:#}; retrying in {:?}",
                operation, attempt, self.settings.max_attempts, error, backoff
            );
            sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
            attempt += 1;
        }
    }

    async fn bucket_names(&self) -> Result<&[String]> {
        self.bucket_cache
            .get_or_try_init(|| self.with_retry("ListBuckets", || self.store.list_buckets()))
            .await
            .map(Vec::as_slice)
    }

    /// Resolves the target for `archive_path`, uploads it and tags it.
    pub async fn upload(
        &self,
        archive_path: &Path,
        site: &str,
        category: RetentionCategory,
    ) -> std::result::Result<UploadTarget, BackupError> {
        let file_name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BackupError::UploadFailed {
                bucket: String::new(),
                key: String::new(),
                reason: format!("{} has no file name", archive_path.display()),
            })?;

        let available: &[String] = match &self.explicit_bucket {
            Some(_) => &[],
            None => self
                .bucket_names()
                .await
                .map_err(|e| BackupError::UploadFailed {
                    bucket: "<unresolved>".into(),
                    key: file_name.clone(),
                    reason: format!("could not list buckets: {:#}", e),
                })?,
        };

        let target = resolve_upload_target(
            self.explicit_bucket.as_deref(),
            available,
            &self.default_bucket,
            site,
            category,
            &file_name,
        );
        debug!("S3 bucket: {} selected", target.bucket);

        self.with_retry("PutObject", || {
            self.store
                .upload_object(&target.bucket, &target.key, archive_path)
        })
        .await
        .map_err(|e| BackupError::UploadFailed {
            bucket: target.bucket.clone(),
            key: target.key.clone(),
            reason: format!("{:#}", e),
        })?;
        info!(
            "Uploaded {} to s3://{}/{}",
            archive_path.display(),
            target.bucket,
            target.key
        );

        let (tag_key, tag_value) = category.tag();
        self.with_retry("PutObjectTagging", || {
            self.store
                .put_object_tag(&target.bucket, &target.key, tag_key, tag_value)
        })
        .await
        .map_err(|e| BackupError::TagFailed {
            bucket: target.bucket.clone(),
            key: target.key.clone(),
            reason: format!("{:#}", e),
        })?;
        debug!(
            "Tagged s3://{}/{} with {}:{}",
            target.bucket, target.key, tag_key, tag_value
        );

        Ok(target)
    }
}
