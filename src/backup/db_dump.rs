// sitebackup/src/backup/db_dump.rs
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backup::credentials::DatabaseCredentials;
use crate::config::DumpSettings;
use crate::errors::BackupError;
use crate::utils::find_executable;

const DEFAULT_DUMP_BINARY: &str = "mysqldump";

fn dump_failed(credentials: &DatabaseCredentials, reason: impl Into<String>) -> BackupError {
    BackupError::DumpFailed {
        database: credentials.database.clone(),
        reason: reason.into(),
    }
}

/// Quotes a value for a MySQL option file.
fn quote_option_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Renders the `[client]` section handed to the dump tool.
///
/// `DB_HOST` may carry a port (`db:3307`) or a socket (`localhost:/run/mysqld.sock`).
fn render_option_file(credentials: &DatabaseCredentials) -> String {
    let mut contents = String::from("[client]\n");
    contents.push_str(&format!("user={}\n", quote_option_value(&credentials.user)));
    contents.push_str(&format!(
        "password={}\n",
        quote_option_value(&credentials.password)
    ));

    if let Some(host) = &credentials.host {
        match host.split_once(':') {
            Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
                contents.push_str(&format!("host={}\n", quote_option_value(name)));
                contents.push_str(&format!("port={}\n", port));
            }
            Some((name, socket)) if socket.starts_with('/') => {
                contents.push_str(&format!("host={}\n", quote_option_value(name)));
                contents.push_str(&format!("socket={}\n", quote_option_value(socket)));
            }
            _ => contents.push_str(&format!("host={}\n", quote_option_value(host))),
        }
    }
    contents
}

/// Writes the client options to a private temp file (0600 on unix).
fn write_option_file(credentials: &DatabaseCredentials) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("sitebackup-client-")
        .suffix(".cnf")
        .tempfile()?;
    file.write_all(render_option_file(credentials).as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn discard_partial_output(dest: &Path) {
    if dest.exists() {
        if let Err(e) = fs::remove_file(dest) {
            warn!("Failed to remove partial dump {}: {}", dest.display(), e);
        }
    }
}

/// Dumps one database into `dest` with the external dump tool.
///
/// The password only ever reaches the child through a temporary option
/// file; the argument vector holds no secrets and no shell is involved.
/// On any failure `dest` is removed so callers never see partial output.
pub async fn dump_database(
    settings: &DumpSettings,
    credentials: &DatabaseCredentials,
    dest: &Path,
) -> Result<PathBuf, BackupError> {
    let dump_binary = find_executable(settings.binary.as_deref(), DEFAULT_DUMP_BINARY)
        .map_err(|e| dump_failed(credentials, format!("{:#}", e)))?;

    let option_file = write_option_file(credentials)
        .map_err(|e| dump_failed(credentials, format!("cannot write client option file: {}", e)))?;

    let output_file = File::create(dest).map_err(|e| {
        dump_failed(
            credentials,
            format!("cannot create {}: {}", dest.display(), e),
        )
    })?;

    debug!(
        database = %credentials.database,
        user = %credentials.user,
        "Dumping database with {} into {}",
        dump_binary.display(),
        dest.display()
    );

    let child = Command::new(&dump_binary)
        // Must come first: mysql tools only honour it as the leading option.
        .arg(format!(
            "--defaults-extra-file={}",
            option_file.path().display()
        ))
        .arg("--single-transaction")
        .arg(&credentials.database)
        .stdin(Stdio::null())
        .stdout(Stdio::from(output_file))
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            discard_partial_output(dest);
            return Err(dump_failed(
                credentials,
                format!("failed to execute {}: {}", dump_binary.display(), e),
            ));
        }
    };

    let output = match timeout(settings.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            discard_partial_output(dest);
            return Err(dump_failed(credentials, format!("failed to wait for dump: {}", e)));
        }
        Err(_) => {
            // Dropping the wait future kills the child (kill_on_drop).
            discard_partial_output(dest);
            return Err(dump_failed(
                credentials,
                format!("timed out after {} seconds", settings.timeout.as_secs()),
            ));
        }
    };

    if !output.status.success() {
        discard_partial_output(dest);
        return Err(dump_failed(
            credentials,
            format!(
                "{} exited with {}: {}",
                dump_binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }

    let size = fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        discard_partial_output(dest);
        return Err(dump_failed(credentials, "dump produced no output"));
    }

    debug!("✓ Database {} dumped ({} bytes)", credentials.database, size);
    Ok(dest.to_path_buf())
}
