//! Upstream health checking.
//!
//! Each load-balancer service gets one probe loop per generation. The
//! per-server state cells live in a process-wide registry keyed by
//! service name, so probe results survive configuration reloads for the
//! URLs that remain; removed servers release their slots. Readers load
//! the state through an atomic cell and never block a probe in progress.
//!
//! State machine per server: `Unknown -> Healthy <-> Unhealthy`.
//! Transitions take two consecutive probe results, except the first
//! success out of `Unknown` which flips immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::dynamic::HealthCheckConfig;

/// Consecutive results needed to flip an established state.
const FLIP_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerHealth {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl ServerHealth {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ServerHealth::Healthy,
            2 => ServerHealth::Unhealthy,
            _ => ServerHealth::Unknown,
        }
    }
}

/// Atomic per-server state cell. The probe loop is the only writer;
/// dispatch paths read the published state without locking.
#[derive(Debug)]
pub struct ServerCell {
    state: AtomicU8,
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
}

impl Default for ServerCell {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(ServerHealth::Unknown as u8),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }
}

impl ServerCell {
    pub fn health(&self) -> ServerHealth {
        ServerHealth::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Considered usable by the balancer: `Unknown` servers receive
    /// traffic until the first probe says otherwise.
    pub fn is_available(&self) -> bool {
        self.health() != ServerHealth::Unhealthy
    }

    /// Apply one probe result, returning the new state.
    pub fn record(&self, success: bool) -> ServerHealth {
        let current = self.health();
        let next = if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            match current {
                // First success out of Unknown flips immediately.
                ServerHealth::Unknown => ServerHealth::Healthy,
                ServerHealth::Unhealthy if successes >= FLIP_THRESHOLD => ServerHealth::Healthy,
                other => other,
            }
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            match current {
                ServerHealth::Healthy | ServerHealth::Unknown
                    if failures >= FLIP_THRESHOLD =>
                {
                    ServerHealth::Unhealthy
                }
                other => other,
            }
        };

        if next != current {
            self.state.store(next as u8, Ordering::Release);
        }
        next
    }
}

/// Health state for one service: URL -> state cell.
#[derive(Debug, Default)]
pub struct ServiceHealth {
    servers: Mutex<HashMap<String, Arc<ServerCell>>>,
}

impl ServiceHealth {
    pub fn cell(&self, url: &str) -> Option<Arc<ServerCell>> {
        self.servers.lock().expect("health lock").get(url).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, ServerHealth> {
        self.servers
            .lock()
            .expect("health lock")
            .iter()
            .map(|(url, cell)| (url.clone(), cell.health()))
            .collect()
    }
}

/// Process-wide registry carrying health state across generations.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    services: Mutex<HashMap<String, Arc<ServiceHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a service's current server list. State for URLs that remain
    /// is preserved; removed URLs release their slots; new URLs start as
    /// `Unknown`. Returns the per-URL cells in server-list order.
    pub fn attach(&self, service_name: &str, urls: &[String]) -> Vec<Arc<ServerCell>> {
        let mut services = self.services.lock().expect("health registry lock");
        let service = services
            .entry(service_name.to_string())
            .or_default()
            .clone();
        drop(services);

        let mut servers = service.servers.lock().expect("health lock");
        servers.retain(|url, _| urls.contains(url));
        urls.iter()
            .map(|url| servers.entry(url.clone()).or_default().clone())
            .collect()
    }

    /// Drop services that no longer exist in the configuration.
    pub fn retain(&self, live_services: &[String]) {
        self.services
            .lock()
            .expect("health registry lock")
            .retain(|name, _| live_services.iter().any(|s| s == name));
    }

    pub fn service(&self, service_name: &str) -> Option<Arc<ServiceHealth>> {
        self.services
            .lock()
            .expect("health registry lock")
            .get(service_name)
            .cloned()
    }
}

/// One probe loop for one service generation. Stops when `shutdown`
/// fires, which happens when the generation is superseded.
pub struct HealthChecker {
    service_name: String,
    config: HealthCheckConfig,
    servers: Vec<(String, Arc<ServerCell>)>,
    client: crate::service::forward::HttpsClient,
}

impl HealthChecker {
    pub fn new(
        service_name: String,
        config: HealthCheckConfig,
        servers: Vec<(String, Arc<ServerCell>)>,
    ) -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Self {
            service_name,
            config,
            servers,
            client: hyper::Client::builder().build(https),
        }
    }

    /// Run probes until cancelled.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.interval.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.probe_all().await,
                _ = shutdown.changed() => {
                    debug!(service = %self.service_name, "Stopping health checks");
                    return;
                }
            }
        }
    }

    async fn probe_all(&self) {
        for (url, cell) in &self.servers {
            let probe_url = format!("{}{}", url.trim_end_matches('/'), self.config.path);
            let success = self.probe(&probe_url).await;

            let before = cell.health();
            let after = cell.record(success);
            crate::observe::set_server_up(&self.service_name, url, cell.is_available());

            if before != after {
                match after {
                    ServerHealth::Healthy => {
                        info!(service = %self.service_name, server = %url, "Server is now healthy")
                    }
                    ServerHealth::Unhealthy => {
                        warn!(service = %self.service_name, server = %url, "Server is now unhealthy")
                    }
                    ServerHealth::Unknown => {}
                }
            }
        }
    }

    async fn probe(&self, url: &str) -> bool {
        let uri: hyper::Uri = match url.parse() {
            Ok(uri) => uri,
            Err(_) => return false,
        };

        let timeout = Duration::from_secs(self.config.timeout.max(1));
        let request = hyper::Request::builder()
            .method(hyper::Method::GET)
            .uri(uri)
            .body(hyper::Body::empty());
        let request = match request {
            Ok(request) => request,
            Err(_) => return false,
        };

        match tokio::time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if self.config.status.is_empty() {
                    status.is_success() || status.is_redirection()
                } else {
                    self.config.status.contains(&status.as_u16())
                }
            }
            Ok(Err(e)) => {
                debug!(url = %url, error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                debug!(url = %url, "Health probe timed out");
                false
            }
        }
    }
}
