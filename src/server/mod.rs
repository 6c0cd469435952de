//! Server assembly: listeners, providers, aggregation, installation.

pub mod entrypoint;
pub mod factory;
pub mod sni;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::access_log::AccessLogger;
use crate::api::ApiHandler;
use crate::config::{DynamicConfig, EntryPointProtocol, StaticConfig};
use crate::middleware::chain::ChainBuilder;
use crate::provider::aggregator::Aggregator;
use crate::provider::file::FileProvider;
use crate::provider::http::HttpProvider;
use crate::provider::{Provider, ProviderPool};
use crate::shutdown::ShutdownManager;
use entrypoint::{TcpEntryPoint, UdpEntryPoint};
use factory::RouterFactory;

/// The assembled edge router.
pub struct Server {
    config: StaticConfig,
    shutdown: Arc<ShutdownManager>,
    access_logger: Option<Arc<AccessLogger>>,
}

impl Server {
    pub fn new(
        config: StaticConfig,
        shutdown: Arc<ShutdownManager>,
        access_logger: Option<Arc<AccessLogger>>,
    ) -> Self {
        Self {
            config,
            shutdown,
            access_logger,
        }
    }

    /// Bind all entry points, launch providers and serve until the
    /// shutdown signal fires, then drain.
    pub async fn run(self) -> Result<()> {
        let api = self
            .config
            .api
            .as_ref()
            .filter(|api| api.enabled)
            .map(|_| Arc::new(ApiHandler::new(&self.config.entry_points)));

        let entry_point_metrics = self
            .config
            .metrics
            .as_ref()
            .map(|m| m.entry_points)
            .unwrap_or(false);
        let chain_builder = Arc::new(ChainBuilder::new(
            self.access_logger.clone(),
            entry_point_metrics,
        ));

        let mut factory = RouterFactory::new(&self.config, chain_builder, api);

        // Bind every listener before anything else: a bind failure is
        // fatal and must abort startup.
        let mut tcp_entry_points = Vec::new();
        let mut udp_entry_points = Vec::new();
        for (name, ep_config) in &self.config.entry_points {
            match ep_config.protocol {
                EntryPointProtocol::Tcp => {
                    let entry_point = TcpEntryPoint::new(name.clone(), ep_config.clone());
                    let listener = entry_point.bind().await?;
                    tokio::spawn(Arc::clone(&entry_point).run(
                        listener,
                        Arc::clone(&self.shutdown),
                    ));
                    tcp_entry_points.push(entry_point);
                }
                EntryPointProtocol::Udp => {
                    let entry_point = UdpEntryPoint::new(name.clone(), ep_config.clone());
                    let socket = entry_point.bind().await?;
                    tokio::spawn(Arc::clone(&entry_point).run(
                        socket,
                        Arc::clone(&self.shutdown),
                    ));
                    udp_entry_points.push(entry_point);
                }
            }
        }

        // Providers feed the aggregator; the aggregator feeds the
        // installer through a watch channel, which naturally coalesces
        // to the most recent snapshot when builds lag behind input.
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
        if let Some(file_config) = &self.config.providers.file {
            providers.push(Arc::new(FileProvider::new(file_config)));
        }
        if let Some(http_config) = &self.config.providers.http {
            providers.push(Arc::new(HttpProvider::new(http_config)));
        }
        let pool = ProviderPool::launch(providers, message_tx).await;

        let (snapshot_tx, mut snapshot_rx) = watch::channel::<Option<DynamicConfig>>(None);
        let throttle = Duration::from_millis(self.config.providers.throttle_ms);
        tokio::spawn(Aggregator::new(message_rx, throttle).run(move |snapshot| {
            if snapshot_tx.send(Some(snapshot)).is_err() {
                warn!("Installer gone, dropping configuration snapshot");
            }
        }));

        info!("Fluxgate started");

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                changed = snapshot_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshot_rx.borrow_and_update().clone();
                    let Some(snapshot) = snapshot else { continue };

                    let generation = factory.create_routers(&snapshot);
                    for entry_point in &tcp_entry_points {
                        if let Some(root) = generation.tcp_roots.get(entry_point.name()) {
                            let count = generation
                                .router_counts
                                .get(entry_point.name())
                                .copied()
                                .unwrap_or(0);
                            entry_point.install(
                                Arc::clone(root),
                                count,
                                generation.drain.clone(),
                            );
                        }
                    }
                    for entry_point in &udp_entry_points {
                        let count = generation
                            .udp_router_counts
                            .get(entry_point.name())
                            .copied()
                            .unwrap_or(0);
                        entry_point.install(
                            generation.udp_handlers.get(entry_point.name()).cloned(),
                            count,
                        );
                    }
                    crate::observe::config_reload(true);
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        pool.shutdown();

        let graceful = self
            .config
            .entry_points
            .values()
            .map(|ep| ep.graceful_timeout)
            .max()
            .unwrap_or(crate::config::DEFAULT_GRACEFUL_TIMEOUT_SECS);
        self.shutdown
            .wait_for_drain(Duration::from_secs(graceful))
            .await;

        info!("Fluxgate stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownSignal;
    use std::io::Write;

    /// End-to-end: static config with a file provider, a live upstream,
    /// and a routed request through the running server.
    #[tokio::test]
    async fn test_server_routes_end_to_end() {
        use hyper::service::{make_service_fn, service_fn};
        use std::convert::Infallible;

        // Upstream.
        let make_svc = make_service_fn(|_| async {
            Ok::<_, Infallible>(service_fn(|_req| async {
                Ok::<_, Infallible>(hyper::Response::new(hyper::Body::from("upstream-ok")))
            }))
        });
        let upstream = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let upstream_addr = upstream.local_addr();
        tokio::spawn(upstream);

        // Dynamic configuration file.
        let mut dynamic = tempfile::NamedTempFile::new().unwrap();
        write!(
            dynamic,
            r#"
[http.routers.site]
entry_points = ["web"]
rule = 'Host(`a.test`)'
service = "backend"

[http.services.backend.load_balancer]
servers = [{{ url = "http://{}" }}]
"#,
            upstream_addr
        )
        .unwrap();
        dynamic.flush().unwrap();

        // Pick a free port for the entry point.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let edge_addr = probe.local_addr().unwrap();
        drop(probe);

        let static_config: StaticConfig = toml::from_str(&format!(
            r#"
[entry_points.web]
address = "{}"

[providers]
throttle_ms = 50

[providers.file]
path = "{}"
watch = false
"#,
            edge_addr,
            dynamic.path().display()
        ))
        .unwrap();

        let shutdown = Arc::new(ShutdownManager::new());
        let server = Server::new(static_config, Arc::clone(&shutdown), None);
        let server_task = tokio::spawn(server.run());

        // Wait for the throttled configuration to install, then request.
        let client = hyper::Client::new();
        let mut response = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let req = hyper::Request::builder()
                .uri(format!("http://{}/", edge_addr))
                .header("host", "a.test")
                .body(hyper::Body::empty())
                .unwrap();
            match client.request(req).await {
                Ok(resp) if resp.status() == hyper::StatusCode::OK => {
                    response = Some(resp);
                    break;
                }
                _ => continue,
            }
        }

        let response = response.expect("server never served the routed request");
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(body, "upstream-ok");

        // An unrouted host 404s.
        let req = hyper::Request::builder()
            .uri(format!("http://{}/", edge_addr))
            .header("host", "other.test")
            .body(hyper::Body::empty())
            .unwrap();
        let resp = client.request(req).await.unwrap();
        assert_eq!(resp.status(), hyper::StatusCode::NOT_FOUND);

        shutdown.initiate(ShutdownSignal::Graceful);
        server_task.await.unwrap().unwrap();
    }
}
