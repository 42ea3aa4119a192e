// sitebackup/src/config/cli.rs
use clap::{ArgGroup, Parser};
use std::path::PathBuf;

use super::RetentionCategory;

pub const DEFAULT_ROOT_DIR: &str = "/var/www";
pub const DEFAULT_BACKUP_DIR: &str = "/home/dchang/backups";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Back up every website under a root directory to S3.
///
/// Each site's files and (for WordPress sites) its MySQL database are
/// packed into `<site>-<YYYYMMDD>.tar.gz` and stored in the daily, monthly
/// or yearly folder.
#[derive(Debug, Clone, Parser)]
#[command(name = "sitebackup", version, about)]
#[command(group(
    ArgGroup::new("retention")
        .required(true)
        .args(["daily", "monthly", "yearly"])
))]
pub struct CliArgs {
    /// Save backup to 'daily' folder
    #[arg(short = 'd', long)]
    pub daily: bool,

    /// Save backup to 'monthly' folder
    #[arg(short = 'm', long)]
    pub monthly: bool,

    /// Save backup to 'yearly' folder
    #[arg(short = 'a', long)]
    pub yearly: bool,

    /// Root directory holding one subdirectory per site
    #[arg(long = "rootdirectory", value_name = "DIR")]
    pub root_directory: Option<PathBuf>,

    /// Directory used to stage the temporary backup
    #[arg(long = "backupdirectory", value_name = "DIR")]
    pub backup_directory: Option<PathBuf>,

    /// S3 bucket to store backups in
    #[arg(long)]
    pub bucket: Option<String>,

    /// Back up only this site
    #[arg(long)]
    pub site: Option<String>,

    /// Print verbose output
    #[arg(long)]
    pub verbose: bool,

    /// Clean up the backup directory after each site
    #[arg(long)]
    pub cleanup: bool,

    /// Optional JSON settings file (S3 endpoint, dump binary, retries)
    #[arg(long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Number of sites backed up concurrently
    #[arg(long, value_name = "N")]
    pub jobs: Option<usize>,
}

impl CliArgs {
    pub fn retention(&self) -> RetentionCategory {
        // clap's group guarantees exactly one flag is set.
        if self.daily {
            RetentionCategory::Daily
        } else if self.monthly {
            RetentionCategory::Monthly
        } else {
            RetentionCategory::Yearly
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_retention_flag_is_required() {
        let err = CliArgs::try_parse_from(["sitebackup", "--site", "blog"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_retention_flags_are_exclusive() {
        let err = CliArgs::try_parse_from(["sitebackup", "--daily", "--yearly"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_short_flags_and_options() -> anyhow::Result<()> {
        let args = CliArgs::try_parse_from([
            "sitebackup",
            "-a",
            "--rootdirectory",
            "/srv/sites",
            "--bucket",
            "archive",
            "--cleanup",
        ])?;
        assert_eq!(args.retention(), RetentionCategory::Yearly);
        assert_eq!(args.root_directory, Some(PathBuf::from("/srv/sites")));
        assert_eq!(args.bucket.as_deref(), Some("archive"));
        assert!(args.cleanup);
        assert!(!args.verbose);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        Ok(())
    }
}
