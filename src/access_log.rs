//! JSON-lines access log with live reopen.
//!
//! One line per request. The file handle is swapped on SIGUSR1 so log
//! rotation works without a restart: rename the file, signal the
//! process, and writes continue on a new inode at the original path.

use chrono::Utc;
use serde::Serialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{FluxgateError, FluxgateResult};

#[derive(Debug, Serialize)]
struct AccessLogEntry<'a> {
    time: String,
    request_id: String,
    entry_point: &'a str,
    method: &'a str,
    host: &'a str,
    uri: &'a str,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_ip: Option<IpAddr>,
    duration_ms: u64,
}

/// Append-only access logger shared by all entry points.
pub struct AccessLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl AccessLogger {
    pub async fn new(path: impl Into<PathBuf>) -> FluxgateResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    FluxgateError::file_system(format!(
                        "failed to create log directory {:?}: {}",
                        parent, e
                    ))
                })?;
            }
        }

        let file = open_append(&path).await?;
        info!(path = ?path, "Access log opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Write one entry. Failures are logged, never propagated: losing a
    /// log line must not fail the request.
    #[allow(clippy::too_many_arguments)]
    pub async fn log(
        &self,
        entry_point: &str,
        method: &str,
        host: &str,
        uri: &str,
        status: u16,
        client_ip: Option<IpAddr>,
        duration: Duration,
    ) {
        let entry = AccessLogEntry {
            time: Utc::now().to_rfc3339(),
            request_id: Uuid::new_v4().to_string(),
            entry_point,
            method,
            host,
            uri,
            status,
            client_ip,
            duration_ms: duration.as_millis() as u64,
        };

        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize access log entry: {}", e);
                return;
            }
        };
        line.push('\n');

        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!("Failed to write access log entry: {}", e);
        }
    }

    /// Reopen the log file at the configured path. Called on SIGUSR1
    /// after rotation; subsequent writes land on the new inode.
    pub async fn reopen(&self) -> FluxgateResult<()> {
        let new_file = open_append(&self.path).await?;
        let mut file = self.file.lock().await;
        if let Err(e) = file.flush().await {
            error!("Failed to flush access log before reopen: {}", e);
        }
        *file = new_file;
        info!(path = ?self.path, "Access log reopened");
        Ok(())
    }
}

async fn open_append(path: &Path) -> FluxgateResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| {
            FluxgateError::file_system(format!("failed to open access log {:?}: {}", path, e))
        })
}
