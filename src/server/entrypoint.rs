//! Entry-point listeners.
//!
//! One accept loop per TCP entry point and one datagram loop per UDP
//! entry point. The current root handler is read through an atomic
//! pointer on every accept; no lock is held on the data path. Installing
//! a new generation is a single swap, and connections opened under the
//! superseded generation get the entry point's grace period to finish
//! before they are closed.

use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::EntryPointConfig;
use crate::error::{FluxgateError, FluxgateResult};
use crate::router::tcp::TcpRouterRoot;
use crate::service::udp::UdpService;
use crate::shutdown::ShutdownManager;

/// The installed generation for one TCP entry point.
struct CurrentTcp {
    root: Arc<TcpRouterRoot>,
    drain: watch::Receiver<bool>,
}

/// A TCP entry point: accept loop plus the atomically swapped root.
pub struct TcpEntryPoint {
    name: String,
    config: EntryPointConfig,
    current: ArcSwapOption<CurrentTcp>,
    current_count: AtomicUsize,
}

impl TcpEntryPoint {
    pub fn new(name: String, config: EntryPointConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            current: ArcSwapOption::empty(),
            current_count: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Swap in a new root. A generation with zero valid routers never
    /// replaces a generation that had some: the previous good
    /// configuration keeps serving.
    pub fn install(
        &self,
        root: Arc<TcpRouterRoot>,
        router_count: usize,
        drain: watch::Receiver<bool>,
    ) {
        if router_count == 0 && self.current_count.load(Ordering::Relaxed) > 0 {
            warn!(
                entry_point = %self.name,
                "New generation has no valid routers, keeping previous one"
            );
            return;
        }

        self.current.store(Some(Arc::new(CurrentTcp { root, drain })));
        self.current_count.store(router_count, Ordering::Relaxed);
        debug!(entry_point = %self.name, routers = router_count, "Installed new root handler");
    }

    /// Bind the listener. Bind failures abort startup.
    pub async fn bind(&self) -> FluxgateResult<TcpListener> {
        TcpListener::bind(self.config.address).await.map_err(|e| {
            FluxgateError::fatal(format!(
                "failed to bind entry point '{}' on {}: {}",
                self.name, self.config.address, e
            ))
        })
    }

    /// Accept loop; returns when shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: Arc<ShutdownManager>,
    ) {
        let local = listener.local_addr().unwrap_or(self.config.address);
        info!(entry_point = %self.name, address = %local, "Entry point listening");

        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(entry_point = %self.name, error = %e, "Accept failed");
                            continue;
                        }
                    };
                    self.handle_accepted(stream, peer, local, &shutdown);
                }
                _ = shutdown_rx.recv() => {
                    info!(entry_point = %self.name, "Stopping accept loop");
                    return;
                }
            }
        }
    }

    fn handle_accepted(
        &self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        shutdown: &Arc<ShutdownManager>,
    ) {
        // The pointer load is the only synchronisation on this path.
        let Some(current) = self.current.load_full() else {
            debug!(entry_point = %self.name, peer = %peer, "No configuration yet, dropping");
            return;
        };

        let task_handle = shutdown.task_handle();
        let entry_point = self.name.clone();
        let graceful = Duration::from_secs(self.config.graceful_timeout);

        crate::observe::open_connections(&entry_point, 1);
        tokio::spawn(async move {
            let _task_handle = task_handle;
            let mut drain = current.drain.clone();

            let serve = Arc::clone(&current.root).serve_connection(stream, peer, local);
            tokio::pin!(serve);

            tokio::select! {
                _ = &mut serve => {}
                _ = async {
                    // Wait for supersession, then allow the grace period.
                    loop {
                        match drain.changed().await {
                            Ok(()) if *drain.borrow() => break,
                            Ok(()) => continue,
                            Err(_) => break,
                        }
                    }
                    tokio::time::sleep(graceful).await;
                } => {
                    debug!(
                        entry_point = %entry_point,
                        peer = %peer,
                        "Closing connection after drain deadline"
                    );
                }
            }

            crate::observe::open_connections(&entry_point, -1);
        });
    }
}

/// The installed generation for one UDP entry point.
struct CurrentUdp {
    service: Arc<UdpService>,
}

/// A UDP entry point: datagram loop with per-client sessions.
pub struct UdpEntryPoint {
    name: String,
    config: EntryPointConfig,
    current: ArcSwapOption<CurrentUdp>,
    current_count: AtomicUsize,
}

impl UdpEntryPoint {
    pub fn new(name: String, config: EntryPointConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            current: ArcSwapOption::empty(),
            current_count: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Swap in a new handler. As on the TCP side, a generation with zero
    /// valid routers never replaces a generation that had some: the
    /// previous good configuration keeps serving.
    pub fn install(&self, service: Option<Arc<UdpService>>, router_count: usize) {
        if router_count == 0 && self.current_count.load(Ordering::Relaxed) > 0 {
            warn!(
                entry_point = %self.name,
                "New generation has no valid UDP routers, keeping previous one"
            );
            return;
        }

        self.current
            .store(service.map(|service| Arc::new(CurrentUdp { service })));
        self.current_count.store(router_count, Ordering::Relaxed);
        debug!(entry_point = %self.name, routers = router_count, "Installed UDP handler");
    }

    pub async fn bind(&self) -> FluxgateResult<Arc<UdpSocket>> {
        UdpSocket::bind(self.config.address)
            .await
            .map(Arc::new)
            .map_err(|e| {
                FluxgateError::fatal(format!(
                    "failed to bind entry point '{}' on {}: {}",
                    self.name, self.config.address, e
                ))
            })
    }

    /// Datagram loop. Session identity is the client address; datagrams
    /// of one session go to the same upstream until the idle timeout.
    pub async fn run(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        shutdown: Arc<ShutdownManager>,
    ) {
        info!(entry_point = %self.name, address = %self.config.address, "UDP entry point listening");

        let sessions: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let idle_timeout = Duration::from_secs(self.config.udp_session_timeout.max(1));

        let mut shutdown_rx = shutdown.subscribe();
        let mut buf = vec![0u8; 65535];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(entry_point = %self.name, error = %e, "UDP receive failed");
                            continue;
                        }
                    };
                    let datagram = buf[..len].to_vec();

                    let existing = sessions.lock().expect("session lock").get(&peer).cloned();
                    match existing {
                        Some(tx) => {
                            // Full session queue: drop the datagram, UDP
                            // semantics allow it.
                            let _ = tx.try_send(datagram);
                        }
                        None => {
                            self.open_session(
                                datagram,
                                peer,
                                Arc::clone(&socket),
                                Arc::clone(&sessions),
                                idle_timeout,
                                &shutdown,
                            );
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(entry_point = %self.name, "Stopping UDP loop");
                    return;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn open_session(
        &self,
        first_datagram: Vec<u8>,
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
        sessions: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>,
        idle_timeout: Duration,
        shutdown: &Arc<ShutdownManager>,
    ) {
        let Some(current) = self.current.load_full() else {
            debug!(entry_point = %self.name, peer = %peer, "No UDP router, dropping datagram");
            return;
        };

        let target = current.service.pick();
        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        sessions.lock().expect("session lock").insert(peer, tx);

        let entry_point = self.name.clone();
        let task_handle = shutdown.task_handle();

        debug!(entry_point = %entry_point, peer = %peer, target = %target, "Opening UDP session");
        tokio::spawn(async move {
            let _task_handle = task_handle;
            if let Err(e) =
                run_session(first_datagram, rx, socket, peer, &target, idle_timeout).await
            {
                debug!(entry_point = %entry_point, peer = %peer, error = %e, "UDP session error");
            }
            sessions.lock().expect("session lock").remove(&peer);
        });
    }
}

/// Relay one UDP session until its idle timeout.
async fn run_session(
    first_datagram: Vec<u8>,
    mut from_client: mpsc::Receiver<Vec<u8>>,
    listener: Arc<UdpSocket>,
    peer: SocketAddr,
    target: &str,
    idle_timeout: Duration,
) -> FluxgateResult<()> {
    let upstream = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| FluxgateError::network(format!("bind session socket: {}", e)))?;
    upstream
        .connect(target)
        .await
        .map_err(|e| FluxgateError::network(format!("connect {}: {}", target, e)))?;

    upstream
        .send(&first_datagram)
        .await
        .map_err(|e| FluxgateError::network(format!("send to {}: {}", target, e)))?;

    let mut buf = vec![0u8; 65535];
    loop {
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        tokio::select! {
            datagram = from_client.recv() => {
                match datagram {
                    Some(datagram) => {
                        upstream
                            .send(&datagram)
                            .await
                            .map_err(|e| FluxgateError::network(format!("send to {}: {}", target, e)))?;
                    }
                    None => return Ok(()),
                }
            }
            received = upstream.recv(&mut buf) => {
                let len = received
                    .map_err(|e| FluxgateError::network(format!("recv from {}: {}", target, e)))?;
                listener
                    .send_to(&buf[..len], peer)
                    .await
                    .map_err(|e| FluxgateError::network(format!("send to client: {}", e)))?;
            }
            _ = &mut idle => {
                debug!(peer = %peer, "UDP session idle timeout");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntryPointProtocol;

    fn entry_point_config(udp_timeout: u64) -> EntryPointConfig {
        EntryPointConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            protocol: EntryPointProtocol::Tcp,
            h2c: false,
            forwarded_headers_trusted_ips: vec![],
            read_timeout: 0,
            idle_timeout: 180,
            graceful_timeout: 10,
            udp_session_timeout: udp_timeout,
        }
    }

    #[tokio::test]
    async fn test_install_keeps_previous_good_generation() {
        use crate::router::tcp::TcpRouterManager;
        use crate::service::tcp::TcpServiceManager;
        use crate::tls::TlsManager;
        use crate::transport::DialerManager;

        let entry_point = TcpEntryPoint::new("web".to_string(), entry_point_config(30));

        let entry_points = vec!["web".to_string()];
        let (services, _) = TcpServiceManager::build(
            &toml::from_str(
                r#"
[pg.load_balancer]
servers = [{ address = "127.0.0.1:5432" }]
"#,
            )
            .unwrap(),
            &DialerManager::new(),
        );
        let tls = Arc::new(TlsManager::new());
        let manager = TcpRouterManager {
            services: &services,
            tls_manager: &tls,
            entry_points: &entry_points,
        };

        let (roots, _) = manager.build_roots(
            &toml::from_str(
                r#"
[pass]
rule = 'HostSNI(`*`)'
service = "pg"
"#,
            )
            .unwrap(),
            HashMap::new(),
            HashMap::new(),
            &[],
            &HashMap::new(),
        );
        let good_root = Arc::clone(&roots["web"]);

        let (_tx1, rx1) = watch::channel(false);
        entry_point.install(Arc::clone(&good_root), 1, rx1);
        assert_eq!(entry_point.current_count.load(Ordering::Relaxed), 1);

        // An empty generation must not evict the good one.
        let (empty_roots, _) = manager.build_roots(
            &HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            &[],
            &HashMap::new(),
        );
        let (_tx2, rx2) = watch::channel(false);
        entry_point.install(Arc::clone(&empty_roots["web"]), 0, rx2);

        let current = entry_point.current.load_full().unwrap();
        assert!(Arc::ptr_eq(&current.root, &good_root));
        assert_eq!(entry_point.current_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_udp_install_keeps_previous_good_generation() {
        use crate::service::udp::UdpServiceManager;

        let (services, _) = UdpServiceManager::build(
            &toml::from_str(
                r#"
[resolvers.load_balancer]
servers = [{ address = "127.0.0.1:5301" }]

[replacement.load_balancer]
servers = [{ address = "127.0.0.1:5302" }]
"#,
            )
            .unwrap(),
        );

        let entry_point = UdpEntryPoint::new("dns".to_string(), entry_point_config(30));
        entry_point.install(services.get("resolvers"), 1);
        assert_eq!(entry_point.current_count.load(Ordering::Relaxed), 1);

        // A generation whose only UDP router got disabled must not evict
        // the good handler.
        entry_point.install(None, 0);
        let current = entry_point.current.load_full().unwrap();
        assert_eq!(current.service.name(), "resolvers");
        assert_eq!(entry_point.current_count.load(Ordering::Relaxed), 1);

        // A generation with a valid router swaps normally.
        entry_point.install(services.get("replacement"), 1);
        let current = entry_point.current.load_full().unwrap();
        assert_eq!(current.service.name(), "replacement");

        // With nothing installed yet, an empty generation is a no-op
        // store rather than a keep.
        let fresh = UdpEntryPoint::new("dns2".to_string(), entry_point_config(30));
        fresh.install(None, 0);
        assert!(fresh.current.load_full().is_none());
    }

    #[tokio::test]
    async fn test_udp_session_affinity_and_reply() {
        use crate::service::udp::UdpServiceManager;

        // Echo upstream.
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                let (len, from) = upstream.recv_from(&mut buf).await.unwrap();
                let mut reply = b"echo:".to_vec();
                reply.extend_from_slice(&buf[..len]);
                upstream.send_to(&reply, from).await.unwrap();
            }
        });

        let (services, _) = UdpServiceManager::build(
            &toml::from_str(&format!(
                r#"
[echo.load_balancer]
servers = [{{ address = "{}" }}]
"#,
                upstream_addr
            ))
            .unwrap(),
        );

        let entry_point = UdpEntryPoint::new("dns".to_string(), entry_point_config(5));
        entry_point.install(services.get("echo"), 1);

        let socket = entry_point.bind().await.unwrap();
        let local_addr = socket.local_addr().unwrap();
        let shutdown = Arc::new(ShutdownManager::new());
        tokio::spawn(Arc::clone(&entry_point).run(socket, Arc::clone(&shutdown)));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(local_addr).await.unwrap();

        client.send(b"one").await.unwrap();
        let mut buf = vec![0u8; 1500];
        let len = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"echo:one");

        // Same client, same session: a second datagram still round-trips.
        client.send(b"two").await.unwrap();
        let len = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"echo:two");

        shutdown.initiate(crate::shutdown::ShutdownSignal::Graceful);
    }
}
