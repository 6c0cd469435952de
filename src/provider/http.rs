//! HTTP provider: polls an endpoint serving the dynamic configuration
//! as JSON and delivers a message whenever the payload changes.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ConfigMessage, Provider};
use crate::config::{DynamicConfig, HttpProviderConfig};
use crate::error::{FluxgateError, FluxgateResult};

pub const PROVIDER_NAME: &str = "http";

pub struct HttpProvider {
    endpoint: String,
    poll_interval: Duration,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: &HttpProviderConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            poll_interval: Duration::from_secs(config.poll_interval.max(1)),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn fetch(&self) -> FluxgateResult<DynamicConfig> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| FluxgateError::network(format!("poll {}: {}", self.endpoint, e)))?;

        if !response.status().is_success() {
            return Err(FluxgateError::network(format!(
                "poll {}: status {}",
                self.endpoint,
                response.status()
            )));
        }

        response
            .json::<DynamicConfig>()
            .await
            .map_err(|e| FluxgateError::config(format!("invalid configuration payload: {}", e)))
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn init(&self) -> FluxgateResult<()> {
        if self.endpoint.is_empty() {
            return Err(FluxgateError::config("http provider endpoint is empty"));
        }
        Ok(())
    }

    async fn provide(&self, tx: mpsc::UnboundedSender<ConfigMessage>) -> FluxgateResult<()> {
        info!(endpoint = %self.endpoint, "Polling dynamic configuration");

        let mut last: Option<DynamicConfig> = None;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            match self.fetch().await {
                Ok(config) => {
                    if last.as_ref() == Some(&config) {
                        debug!(endpoint = %self.endpoint, "Configuration unchanged");
                        continue;
                    }
                    last = Some(config.clone());
                    if tx
                        .send(ConfigMessage {
                            provider_name: PROVIDER_NAME.to_string(),
                            configuration: config,
                        })
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "Poll failed, keeping last configuration");
                }
            }
        }
    }
}
