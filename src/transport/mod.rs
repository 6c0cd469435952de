//! Outbound transports: named dial configurations and connection pools.
//!
//! The dialer manager owns one [`Dialer`] per named transport for the raw
//! TCP plane and one pooled hyper client per named transport for the HTTP
//! plane. `update` swaps the name table atomically; entries whose
//! configuration is unchanged keep their pools, everything else is
//! dropped and drains as its idle connections close.

use arc_swap::ArcSwap;
use hyper::client::HttpConnector;
use hyper::Body;
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::config::dynamic::TransportConfig;
use crate::error::{FluxgateError, FluxgateResult};

mod insecure;

/// Name used when a service references no transport.
pub const DEFAULT_TRANSPORT: &str = "default";

type HttpsClient = hyper::Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

struct TransportEntry {
    config: TransportConfig,
    dialer: Arc<Dialer>,
    http_client: HttpsClient,
}

/// Named transport table, atomically replaced on configuration reload.
pub struct DialerManager {
    transports: ArcSwap<HashMap<String, Arc<TransportEntry>>>,
}

impl Default for DialerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DialerManager {
    pub fn new() -> Self {
        let manager = Self {
            transports: ArcSwap::from_pointee(HashMap::new()),
        };
        manager.update(&HashMap::new());
        manager
    }

    /// Replace the named transport set. A "default" transport is always
    /// present. Entries whose configuration is unchanged are carried over
    /// so their idle connection pools survive; removed or changed entries
    /// drop and drain.
    pub fn update(&self, configs: &HashMap<String, TransportConfig>) {
        let previous = self.transports.load_full();
        let mut next: HashMap<String, Arc<TransportEntry>> = HashMap::new();

        let mut wanted: HashMap<String, TransportConfig> = configs.clone();
        wanted
            .entry(DEFAULT_TRANSPORT.to_string())
            .or_insert_with(TransportConfig::default);

        for (name, config) in wanted {
            match previous.get(&name) {
                Some(entry) if entry.config == config => {
                    next.insert(name, Arc::clone(entry));
                }
                _ => {
                    debug!(transport = %name, "Building transport");
                    next.insert(
                        name.clone(),
                        Arc::new(TransportEntry {
                            dialer: Arc::new(Dialer::new(name, config.clone())),
                            http_client: build_http_client(&config),
                            config,
                        }),
                    );
                }
            }
        }

        let dropped = previous.len().saturating_sub(
            previous.keys().filter(|k| next.contains_key(*k)).count(),
        );
        if dropped > 0 {
            info!(count = dropped, "Draining removed transports");
        }

        self.transports.store(Arc::new(next));
    }

    /// Dialer for the raw TCP plane.
    pub fn dialer(&self, name: &str) -> FluxgateResult<Arc<Dialer>> {
        self.transports
            .load()
            .get(name)
            .map(|e| Arc::clone(&e.dialer))
            .ok_or_else(|| FluxgateError::config(format!("unknown transport '{}'", name)))
    }

    /// Pooled hyper client for the HTTP plane.
    pub fn http_client(&self, name: &str) -> FluxgateResult<HttpsClient> {
        self.transports
            .load()
            .get(name)
            .map(|e| e.http_client.clone())
            .ok_or_else(|| FluxgateError::config(format!("unknown transport '{}'", name)))
    }

    /// Response header timeout configured on a transport, if any.
    pub fn response_header_timeout(&self, name: &str) -> Option<Duration> {
        self.transports.load().get(name).and_then(|e| {
            (e.config.response_header_timeout > 0)
                .then(|| Duration::from_secs(e.config.response_header_timeout))
        })
    }
}

fn build_http_client(config: &TransportConfig) -> HttpsClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(Some(Duration::from_secs(config.dial_timeout.max(1))));
    if config.keep_alive > 0 {
        http.set_keepalive(Some(Duration::from_secs(config.keep_alive)));
    }

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();

    hyper::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(config.max_idle_conns_per_host)
        .build::<_, Body>(https)
}

/// Establishes one outbound TCP connection per call with the transport's
/// timeout, keepalive, optional TLS wrap and optional PROXY protocol
/// header.
pub struct Dialer {
    name: String,
    config: TransportConfig,
    tls: Option<TlsConnector>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Dialer {
    fn new(name: String, config: TransportConfig) -> Self {
        let tls = config.tls.as_ref().map(|tls_config| {
            let client_config = if tls_config.insecure_skip_verify {
                rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(
                        insecure::NoServerCertVerification::new(),
                    ))
                    .with_no_client_auth()
            } else {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            };
            TlsConnector::from(Arc::new(client_config))
        });

        Self { name, config, tls }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dial an upstream. `client` carries the accepted connection's peer
    /// and local addresses for the PROXY protocol header.
    pub async fn dial(
        &self,
        addr: &str,
        client: Option<(SocketAddr, SocketAddr)>,
    ) -> FluxgateResult<DialedStream> {
        let resolved: SocketAddr = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| FluxgateError::network(format!("resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| FluxgateError::network(format!("no address for {}", addr)))?;

        let socket = if resolved.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| FluxgateError::io(format!("socket: {}", e)))?;

        if self.config.keep_alive > 0 {
            socket
                .set_keepalive(true)
                .map_err(|e| FluxgateError::io(format!("keepalive: {}", e)))?;
        }

        let timeout = Duration::from_secs(self.config.dial_timeout.max(1));
        let stream = tokio::time::timeout(timeout, socket.connect(resolved))
            .await
            .map_err(|_| FluxgateError::timeout(timeout, format!("dial {}", addr)))?
            .map_err(|e| FluxgateError::network(format!("dial {}: {}", addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| FluxgateError::io(format!("nodelay: {}", e)))?;

        let mut stream = match &self.tls {
            Some(connector) => {
                let server_name = self
                    .config
                    .tls
                    .as_ref()
                    .and_then(|t| t.server_name.clone())
                    .unwrap_or_else(|| resolved.ip().to_string());
                let server_name = ServerName::try_from(server_name)
                    .map_err(|e| FluxgateError::tls(format!("invalid server name: {}", e)))?;
                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| FluxgateError::tls(format!("handshake with {}: {}", addr, e)))?;
                DialedStream::Tls(Box::new(tls_stream))
            }
            None => DialedStream::Plain(stream),
        };

        if self.config.proxy_protocol {
            if let Some((peer, local)) = client {
                let header = proxy_protocol_header(peer, local);
                stream
                    .write_all(header.as_bytes())
                    .await
                    .map_err(|e| FluxgateError::network(format!("PROXY header: {}", e)))?;
            }
        }

        Ok(stream)
    }
}

/// PROXY protocol v1 header for the original client connection.
fn proxy_protocol_header(peer: SocketAddr, local: SocketAddr) -> String {
    let family = if peer.is_ipv4() { "TCP4" } else { "TCP6" };
    format!(
        "PROXY {} {} {} {} {}\r\n",
        family,
        peer.ip(),
        local.ip(),
        peer.port(),
        local.port()
    )
}

/// An established upstream connection, optionally TLS-wrapped.
#[derive(Debug)]
pub enum DialedStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for DialedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DialedStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DialedStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DialedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            DialedStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DialedStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DialedStream::Plain(s) => Pin::new(s).poll_flush(cx),
            DialedStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DialedStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DialedStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
