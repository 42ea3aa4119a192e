// sitebackup/src/backup/credentials.rs
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::errors::BackupError;

pub const SITE_CONFIG_FILE: &str = "wp-config.php";

// One `define('KEY', 'value');` per line, exactly as WordPress writes it.
static DEFINE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^define\('(DB_NAME|DB_USER|DB_PASSWORD|DB_HOST)',\s*'([^']*)'\);$")
        .expect("define pattern is valid")
});

#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseCredentials {
    pub database: String,
    pub user: String,
    pub password: String,
    /// `DB_HOST`, when the site declares one.
    pub host: Option<String>,
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .finish()
    }
}

/// Scans config text for the database declarations.
///
/// Returns `CredentialsIncomplete` naming every required field that is
/// absent or empty.
pub fn parse_credentials(contents: &str) -> Result<DatabaseCredentials, BackupError> {
    let mut database = String::new();
    let mut user = String::new();
    let mut password = String::new();
    let mut host = String::new();

    for line in contents.lines() {
        if let Some(caps) = DEFINE_LINE.captures(line) {
            let value = caps[2].to_string();
            match &caps[1] {
                "DB_NAME" => database = value,
                "DB_USER" => user = value,
                "DB_PASSWORD" => password = value,
                _ => host = value,
            }
        }
    }

    let mut missing = Vec::new();
    if database.is_empty() {
        missing.push("DB_NAME");
    }
    if user.is_empty() {
        missing.push("DB_USER");
    }
    if password.is_empty() {
        missing.push("DB_PASSWORD");
    }
    if !missing.is_empty() {
        return Err(BackupError::CredentialsIncomplete { missing });
    }

    Ok(DatabaseCredentials {
        database,
        user,
        password,
        host: Some(host).filter(|h| !h.is_empty()),
    })
}

/// Looks for the site's `wp-config.php` and extracts its credentials.
///
/// `None` means "no database backup for this site": either the site has no
/// config (static sites) or the config lacks one of the required fields.
pub fn extract_credentials(site_dir: &Path) -> Option<DatabaseCredentials> {
    let config_path = site_dir.join(SITE_CONFIG_FILE);
    if !config_path.is_file() {
        debug!("Couldn't find {} in {}", SITE_CONFIG_FILE, site_dir.display());
        return None;
    }

    // WordPress configs are usually UTF-8, but don't choke on stray bytes.
    let contents = match fs::read(&config_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!("Failed to read {}: {}", config_path.display(), e);
            return None;
        }
    };

    match parse_credentials(&contents) {
        Ok(credentials) => {
            debug!(
                database = %credentials.database,
                user = %credentials.user,
                "Extracted database credentials from {}",
                config_path.display()
            );
            Some(credentials)
        }
        Err(e) => {
            warn!("{} in {}, skipping database backup", e, config_path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WP_CONFIG: &str = "<?php\n\
        // ** MySQL settings ** //\n\
        define('DB_NAME', 's1');\n\
        define('DB_USER', 'u1');\n\
        define('DB_PASSWORD', 'p1');\n\
        define('DB_HOST', 'localhost');\n\
        define('DB_CHARSET', 'utf8mb4');\n";

    #[test]
    fn test_parse_complete_config() -> anyhow::Result<()> {
        let creds = parse_credentials(WP_CONFIG)?;
        assert_eq!(creds.database, "s1");
        assert_eq!(creds.user, "u1");
        assert_eq!(creds.password, "p1");
        assert_eq!(creds.host.as_deref(), Some("localhost"));
        Ok(())
    }

    #[test]
    fn test_parse_reports_missing_fields() {
        let contents = "define('DB_NAME', 's1');\ndefine('DB_PASSWORD', '');\n";
        match parse_credentials(contents) {
            Err(BackupError::CredentialsIncomplete { missing }) => {
                assert_eq!(missing, vec!["DB_USER", "DB_PASSWORD"]);
            }
            other => panic!("expected CredentialsIncomplete, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_is_strictly_line_based() {
        // Indented, double-quoted and commented declarations don't match.
        let contents = "  define('DB_NAME', 's1');\n\
            define(\"DB_USER\", \"u1\");\n\
            // define('DB_PASSWORD', 'p1');\n";
        assert!(parse_credentials(contents).is_err());
    }

    #[test]
    fn test_parse_tolerates_crlf_and_spacing() -> anyhow::Result<()> {
        let contents = "define('DB_NAME','s1');\r\n\
                        define('DB_USER',    'u1');\r\n\
                        define('DB_PASSWORD',\t'p@ss word');\r\n";
        let creds = parse_credentials(contents)?;
        assert_eq!(creds.password, "p@ss word");
        assert_eq!(creds.host, None);
        Ok(())
    }

    #[test]
    fn test_debug_redacts_password() -> anyhow::Result<()> {
        let creds = parse_credentials(WP_CONFIG)?;
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("p1"));
        assert!(rendered.contains("<redacted>"));
        Ok(())
    }

    #[test]
    fn test_extract_without_config_file_is_none() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(extract_credentials(dir.path()).is_none());
        Ok(())
    }

    #[test]
    fn test_extract_reads_site_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(SITE_CONFIG_FILE), WP_CONFIG)?;
        let creds = extract_credentials(dir.path()).expect("credentials");
        assert_eq!(creds.database, "s1");

        fs::write(dir.path().join(SITE_CONFIG_FILE), "define('DB_NAME', 's1');\n")?;
        assert!(extract_credentials(dir.path()).is_none());
        Ok(())
    }
}
