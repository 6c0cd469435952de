//! Dynamic configuration providers.
//!
//! A provider pushes full [`DynamicConfig`] snapshots onto the shared
//! channel whenever its source changes; the aggregator debounces and
//! merges them. Providers run as tasks until the pool is shut down.

pub mod aggregator;
pub mod file;
pub mod http;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::DynamicConfig;
use crate::error::FluxgateResult;

/// One message from a provider: its name plus a full snapshot.
#[derive(Debug, Clone)]
pub struct ConfigMessage {
    pub provider_name: String,
    pub configuration: DynamicConfig,
}

/// A source of dynamic configuration.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Preparation before the provide loop starts; a failing init keeps
    /// the provider out of the pool.
    async fn init(&self) -> FluxgateResult<()>;

    /// Deliver configurations on `tx` until the task is cancelled.
    async fn provide(&self, tx: mpsc::UnboundedSender<ConfigMessage>) -> FluxgateResult<()>;
}

/// Running provider tasks.
pub struct ProviderPool {
    handles: Vec<JoinHandle<()>>,
}

impl ProviderPool {
    /// Init every provider and spawn its provide loop. A provider whose
    /// `init` fails is skipped with an error; the rest still run.
    pub async fn launch(
        providers: Vec<Arc<dyn Provider>>,
        tx: mpsc::UnboundedSender<ConfigMessage>,
    ) -> Self {
        let mut handles = Vec::new();

        for provider in providers {
            if let Err(e) = provider.init().await {
                error!(provider = %provider.name(), error = %e, "Provider init failed");
                continue;
            }
            info!(provider = %provider.name(), "Starting provider");

            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = provider.provide(tx).await {
                    error!(provider = %provider.name(), error = %e, "Provider stopped");
                }
            }));
        }

        Self { handles }
    }

    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for ProviderPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProvider {
        name: String,
        fail_init: bool,
    }

    #[async_trait]
    impl Provider for StaticProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn init(&self) -> FluxgateResult<()> {
            if self.fail_init {
                Err(crate::error::FluxgateError::config("broken provider"))
            } else {
                Ok(())
            }
        }

        async fn provide(&self, tx: mpsc::UnboundedSender<ConfigMessage>) -> FluxgateResult<()> {
            tx.send(ConfigMessage {
                provider_name: self.name.clone(),
                configuration: DynamicConfig::default(),
            })
            .ok();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pool_skips_failing_init() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let providers: Vec<Arc<dyn Provider>> = vec![
            Arc::new(StaticProvider {
                name: "good".to_string(),
                fail_init: false,
            }),
            Arc::new(StaticProvider {
                name: "bad".to_string(),
                fail_init: true,
            }),
        ];

        let _pool = ProviderPool::launch(providers, tx).await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.provider_name, "good");
        // Only the good provider delivered anything.
        assert!(rx.try_recv().is_err());
    }
}
