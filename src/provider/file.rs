//! File provider: parses a TOML dynamic configuration file and
//! re-delivers it whenever the file changes on disk.

use async_trait::async_trait;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{ConfigMessage, Provider};
use crate::config::{DynamicConfig, FileProviderConfig};
use crate::error::{FluxgateError, FluxgateResult};

pub const PROVIDER_NAME: &str = "file";

pub struct FileProvider {
    path: PathBuf,
    watch: bool,
}

impl FileProvider {
    pub fn new(config: &FileProviderConfig) -> Self {
        Self {
            path: PathBuf::from(&config.path),
            watch: config.watch,
        }
    }

    async fn load(path: &Path) -> FluxgateResult<DynamicConfig> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            FluxgateError::file_system(format!("failed to read {:?}: {}", path, e))
        })?;
        let config: DynamicConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn init(&self) -> FluxgateResult<()> {
        // Fail fast on an unreadable or unparsable initial file.
        Self::load(&self.path).await.map(|_| ())
    }

    async fn provide(&self, tx: mpsc::UnboundedSender<ConfigMessage>) -> FluxgateResult<()> {
        let initial = Self::load(&self.path).await?;
        tx.send(ConfigMessage {
            provider_name: PROVIDER_NAME.to_string(),
            configuration: initial,
        })
        .map_err(|_| FluxgateError::internal("configuration channel closed"))?;

        if !self.watch {
            return Ok(());
        }

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if let Err(e) = event_tx.blocking_send(event) {
                        error!("Failed to send file change event: {}", e);
                    }
                }
                Err(e) => error!("File watch error: {}", e),
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(1)),
        )?;

        // Watch the file and its directory: editors and rotation tools
        // replace the inode rather than writing in place.
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                watcher.watch(parent, RecursiveMode::NonRecursive)?;
            }
        }

        info!(path = ?self.path, "Watching dynamic configuration file");

        while let Some(event) = event_rx.recv().await {
            use notify::EventKind;
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                continue;
            }
            let relevant = event
                .paths
                .iter()
                .any(|p| p == &self.path || (p.is_dir() && self.path.starts_with(p)));
            if !relevant {
                continue;
            }

            debug!(path = ?self.path, "Dynamic configuration change detected");
            // Small delay so a writer finishes before the re-parse.
            tokio::time::sleep(Duration::from_millis(100)).await;

            match Self::load(&self.path).await {
                Ok(config) => {
                    if tx
                        .send(ConfigMessage {
                            provider_name: PROVIDER_NAME.to_string(),
                            configuration: config,
                        })
                        .is_err()
                    {
                        return Ok(()); // aggregator gone, shut down
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to reload dynamic configuration (keeping current): {}",
                        e
                    );
                }
            }
        }

        Ok(())
    }
}
