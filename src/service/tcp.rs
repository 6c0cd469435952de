//! TCP service plane: round-robin dial-and-splice forwarders.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::dynamic::TcpServiceConfig;
use crate::error::{FluxgateError, FluxgateResult};
use crate::transport::{Dialer, DialerManager, DEFAULT_TRANSPORT};

/// A TCP load-balanced service: picks an upstream, dials it through the
/// named transport and splices bytes both ways until either side closes.
pub struct TcpService {
    name: String,
    servers: Vec<String>,
    counter: AtomicUsize,
    dialer: Arc<Dialer>,
}

impl TcpService {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn pick(&self) -> &str {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        &self.servers[index]
    }

    /// Proxy one accepted connection. `peeked` carries bytes already
    /// consumed from the client (the ClientHello sniff) and is replayed
    /// to the upstream before splicing starts. The downstream may be a
    /// raw socket or a terminated TLS stream.
    pub async fn handle<S>(
        &self,
        mut downstream: S,
        peeked: &[u8],
        client: (SocketAddr, SocketAddr),
    ) -> FluxgateResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let target = self.pick().to_string();
        debug!(service = %self.name, target = %target, "Proxying TCP connection");

        let mut upstream = self.dialer.dial(&target, Some(client)).await?;

        if !peeked.is_empty() {
            upstream
                .write_all(peeked)
                .await
                .map_err(|e| FluxgateError::network(format!("replay to {}: {}", target, e)))?;
        }

        match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
            Ok((up, down)) => {
                debug!(
                    service = %self.name,
                    target = %target,
                    bytes_up = up,
                    bytes_down = down,
                    "TCP connection closed"
                );
                Ok(())
            }
            Err(e) => Err(FluxgateError::network(format!(
                "splice with {}: {}",
                target, e
            ))),
        }
    }
}

/// Per-generation table of TCP services.
pub struct TcpServiceManager {
    services: HashMap<String, Arc<TcpService>>,
}

impl TcpServiceManager {
    pub fn build(
        configs: &HashMap<String, TcpServiceConfig>,
        dialers: &DialerManager,
    ) -> (Self, BTreeMap<String, Vec<String>>) {
        let mut services = HashMap::new();
        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (name, config) in configs {
            let TcpServiceConfig::LoadBalancer(lb) = config;

            if lb.servers.is_empty() {
                warn!(service = %name, "TCP load balancer has no servers");
                errors
                    .entry(name.clone())
                    .or_default()
                    .push("load balancer has no servers".to_string());
                continue;
            }

            let transport = lb.transport.as_deref().unwrap_or(DEFAULT_TRANSPORT);
            let dialer = match dialers.dialer(transport) {
                Ok(dialer) => dialer,
                Err(e) => {
                    errors.entry(name.clone()).or_default().push(e.to_string());
                    continue;
                }
            };

            services.insert(
                name.clone(),
                Arc::new(TcpService {
                    name: name.clone(),
                    servers: lb.servers.iter().map(|s| s.address.clone()).collect(),
                    counter: AtomicUsize::new(0),
                    dialer,
                }),
            );
        }

        (Self { services }, errors)
    }

    pub fn get(&self, name: &str) -> Option<Arc<TcpService>> {
        self.services.get(name).cloned()
    }
}
