//! TCP router root: per-entry-point connection dispatch.
//!
//! Every accepted connection is peeked for a TLS ClientHello. Plaintext
//! connections try the non-TLS TCP routers first and fall back to the
//! HTTP plaintext handler. TLS connections are matched by SNI/ALPN/
//! client IP against the TLS TCP routers in priority order: a
//! passthrough match splices the encrypted stream untouched, a
//! terminating match decrypts and splices, and no match terminates with
//! the HTTPS acceptor and delegates to the HTTP TLS handler.

use hyper::server::conn::Http;
use hyper::service::service_fn;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::dynamic::TcpRouterConfig;
use crate::error::{FluxgateError, FluxgateResult};
use crate::middleware::chain::error_response;
use crate::middleware::HttpHandler;
use crate::router::rule::{cached_tcp_rule, ConnProjection, Expr, IpPrefix, TcpMatcher};
use crate::server::sni::{inspect, HelloInspection};
use crate::service::forward::ForwardContext;
use crate::service::tcp::{TcpService, TcpServiceManager};
use crate::tls::{TlsManager, DEFAULT_OPTIONS};

struct CompiledTcpRouter {
    name: String,
    priority: i64,
    rule: Arc<Expr<TcpMatcher>>,
    /// None = plaintext router; Some((passthrough, acceptor))
    tls: Option<(bool, Option<TlsAcceptor>)>,
    service: Arc<TcpService>,
}

/// Per-entry-point HTTP plane settings, taken from the static
/// configuration.
#[derive(Clone, Default)]
pub struct EntryPointHttpConfig {
    /// Header-read timeout; also bounds keep-alive idle waits
    pub header_read_timeout: Option<std::time::Duration>,
    /// Serve prior-knowledge HTTP/2 on cleartext connections
    pub h2c: bool,
    /// Clients allowed to supply X-Forwarded-* headers
    pub trusted_forwarders: Vec<IpPrefix>,
}

/// Root handler for one TCP entry point generation.
pub struct TcpRouterRoot {
    entry_point: String,
    routers: Vec<CompiledTcpRouter>,
    http_plain: HttpHandler,
    http_tls: HttpHandler,
    /// Acceptor for HTTPS delegation when no TCP router matches
    https_acceptor: Option<TlsAcceptor>,
    /// True when any HTTP TLS router exists on this entry point
    has_https: bool,
    http_config: EntryPointHttpConfig,
}

impl TcpRouterRoot {
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Number of TCP routers compiled into this root.
    pub fn router_count(&self) -> usize {
        self.routers.len()
    }

    /// Handle one accepted connection end to end. Errors are logged and
    /// end in a close; nothing propagates past the entry point.
    pub async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
    ) {
        let (peeked, verdict) = inspect(&stream).await;

        let result = match verdict {
            HelloInspection::Plaintext => self.serve_plaintext(stream, &peeked, peer, local).await,
            HelloInspection::Tls(info) => {
                let projection = ConnProjection {
                    sni: info.sni,
                    alpn: info.alpn,
                    client_ip: Some(peer.ip()),
                };
                self.serve_tls(stream, projection, peer, local).await
            }
            HelloInspection::Undecided => {
                debug!(peer = %peer, "Closing undecidable connection");
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(peer = %peer, error = %e, "Connection ended with error");
        }
    }

    async fn serve_plaintext(
        &self,
        stream: TcpStream,
        peeked: &[u8],
        peer: SocketAddr,
        local: SocketAddr,
    ) -> FluxgateResult<()> {
        let projection = ConnProjection {
            sni: None,
            alpn: Vec::new(),
            client_ip: Some(peer.ip()),
        };

        // Plaintext TCP routers win over HTTP on the same entry point.
        if let Some(router) = self
            .routers
            .iter()
            .filter(|r| r.tls.is_none())
            .find(|r| r.rule.matches(|m| m.matches(&projection)))
        {
            debug!(router = %router.name, peer = %peer, "TCP router matched (plaintext)");
            return router.service.handle(stream, &[], (peer, local)).await;
        }

        // h2c clients announce themselves with the HTTP/2 preface.
        let h2c = self.http_config.h2c && peeked.starts_with(b"PRI * HTTP/2.0");
        serve_http(
            stream,
            self.http_plain.clone(),
            peer,
            "http",
            &self.http_config,
            h2c,
        )
        .await
    }

    async fn serve_tls(
        &self,
        stream: TcpStream,
        projection: ConnProjection,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> FluxgateResult<()> {
        let matched = self
            .routers
            .iter()
            .filter(|r| r.tls.is_some())
            .find(|r| r.rule.matches(|m| m.matches(&projection)));

        if let Some((router, (passthrough, acceptor))) =
            matched.and_then(|r| r.tls.as_ref().map(|tls| (r, tls)))
        {
            debug!(
                router = %router.name,
                peer = %peer,
                sni = projection.sni.as_deref().unwrap_or(""),
                passthrough,
                "TCP router matched (TLS)"
            );

            if *passthrough {
                // Nothing was consumed from the socket; the upstream
                // sees the original ClientHello.
                return router.service.handle(stream, &[], (peer, local)).await;
            }

            let acceptor = acceptor.as_ref().ok_or_else(|| {
                FluxgateError::tls(format!("router '{}' has no TLS acceptor", router.name))
            })?;
            let decrypted = acceptor
                .accept(stream)
                .await
                .map_err(|e| FluxgateError::tls(format!("handshake: {}", e)))?;
            record_tls_metrics(&self.entry_point, decrypted.get_ref().1);
            return router.service.handle(decrypted, &[], (peer, local)).await;
        }

        // No TCP router: delegate to the HTTP TLS plane.
        if !self.has_https {
            debug!(peer = %peer, "No TLS router matched, closing");
            return Ok(());
        }
        let acceptor = self
            .https_acceptor
            .as_ref()
            .ok_or_else(|| FluxgateError::tls("no HTTPS acceptor configured"))?;
        let decrypted = acceptor
            .accept(stream)
            .await
            .map_err(|e| FluxgateError::tls(format!("handshake: {}", e)))?;
        record_tls_metrics(&self.entry_point, decrypted.get_ref().1);
        serve_http(
            decrypted,
            self.http_tls.clone(),
            peer,
            "https",
            &self.http_config,
            false,
        )
        .await
    }
}

fn record_tls_metrics(entry_point: &str, connection: &rustls::ServerConnection) {
    let version = connection
        .protocol_version()
        .map(|v| format!("{:?}", v))
        .unwrap_or_else(|| "unknown".to_string());
    let cipher = connection
        .negotiated_cipher_suite()
        .map(|c| format!("{:?}", c.suite()))
        .unwrap_or_else(|| "unknown".to_string());
    crate::observe::tls_request(entry_point, &version, &cipher);
}

/// Serve HTTP/1.x (or prior-knowledge HTTP/2 when `h2` is set) on an
/// accepted stream.
pub(crate) async fn serve_http<S>(
    stream: S,
    handler: HttpHandler,
    peer: SocketAddr,
    scheme: &'static str,
    http_config: &EntryPointHttpConfig,
    h2: bool,
) -> FluxgateResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let trusted = http_config.trusted_forwarders.is_empty()
        || http_config
            .trusted_forwarders
            .iter()
            .any(|prefix| prefix.contains(peer.ip()));

    let service = service_fn(move |mut req: hyper::Request<hyper::Body>| {
        let handler = handler.clone();
        let ctx = ForwardContext {
            client_ip: Some(peer.ip()),
            client_scheme: scheme,
        };
        // Only trusted clients may supply forwarding headers.
        if !trusted {
            for header in ["x-forwarded-for", "x-forwarded-proto", "x-forwarded-host"] {
                req.headers_mut().remove(header);
            }
        }
        async move {
            let response = match handler.call(req, ctx).await {
                Ok(response) => response,
                Err(e) => error_response(&e),
            };
            Ok::<_, Infallible>(response)
        }
    });

    let mut http = Http::new();
    if let Some(timeout) = http_config.header_read_timeout {
        http.http1_header_read_timeout(timeout);
    }
    if h2 {
        http.http2_only(true);
    }

    http.serve_connection(stream, service)
        .await
        .map_err(|e| FluxgateError::network(format!("serve connection: {}", e)))
}

/// Builds TCP router roots for one generation.
pub struct TcpRouterManager<'a> {
    pub services: &'a TcpServiceManager,
    pub tls_manager: &'a Arc<TlsManager>,
    pub entry_points: &'a [String],
}

impl<'a> TcpRouterManager<'a> {
    /// Build one root per entry point. `http_plain`/`http_tls` are the
    /// already chain-wrapped HTTP handlers per entry point;
    /// `https_entry_points` lists entry points carrying at least one
    /// HTTP TLS router.
    pub fn build_roots(
        &self,
        routers: &HashMap<String, TcpRouterConfig>,
        mut http_plain: HashMap<String, HttpHandler>,
        mut http_tls: HashMap<String, HttpHandler>,
        https_entry_points: &[String],
        http_configs: &HashMap<String, EntryPointHttpConfig>,
    ) -> (HashMap<String, Arc<TcpRouterRoot>>, BTreeMap<String, Vec<String>>) {
        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut per_entry_point: HashMap<String, Vec<CompiledTcpRouter>> = self
            .entry_points
            .iter()
            .map(|ep| (ep.clone(), Vec::new()))
            .collect();

        for (name, config) in routers {
            match self.compile(name, config) {
                Ok((entry_points, compiled)) => {
                    for ep in entry_points {
                        let compiled = CompiledTcpRouter {
                            name: compiled.name.clone(),
                            priority: compiled.priority,
                            rule: Arc::clone(&compiled.rule),
                            tls: compiled.tls.clone(),
                            service: Arc::clone(&compiled.service),
                        };
                        per_entry_point.entry(ep).or_default().push(compiled);
                    }
                }
                Err(e) => {
                    warn!(router = %name, error = %e, "TCP router disabled");
                    errors.entry(name.clone()).or_default().push(e.to_string());
                }
            }
        }

        let https_acceptor = self
            .tls_manager
            .server_config(DEFAULT_OPTIONS)
            .ok()
            .map(TlsAcceptor::from);

        let mut roots = HashMap::new();
        for ep in self.entry_points {
            let mut compiled = per_entry_point.remove(ep).unwrap_or_default();
            compiled.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));

            roots.insert(
                ep.clone(),
                Arc::new(TcpRouterRoot {
                    entry_point: ep.clone(),
                    routers: compiled,
                    http_plain: http_plain
                        .remove(ep)
                        .unwrap_or_else(|| HttpHandler::fixed_status(hyper::StatusCode::NOT_FOUND)),
                    http_tls: http_tls
                        .remove(ep)
                        .unwrap_or_else(|| HttpHandler::fixed_status(hyper::StatusCode::NOT_FOUND)),
                    https_acceptor: https_acceptor.clone(),
                    has_https: https_entry_points.contains(ep),
                    http_config: http_configs.get(ep).cloned().unwrap_or_default(),
                }),
            );
        }

        (roots, errors)
    }

    fn compile(
        &self,
        name: &str,
        config: &TcpRouterConfig,
    ) -> FluxgateResult<(Vec<String>, CompiledTcpRouter)> {
        let entry_points = if config.entry_points.is_empty() {
            self.entry_points.to_vec()
        } else {
            for ep in &config.entry_points {
                if !self.entry_points.contains(ep) {
                    return Err(FluxgateError::config(format!(
                        "entryPoint \"{}\" doesn't exist",
                        ep
                    )));
                }
            }
            config.entry_points.clone()
        };

        let rule = cached_tcp_rule(&config.rule)?;

        let service = self.services.get(&config.service).ok_or_else(|| {
            FluxgateError::config(format!("service \"{}\" does not exist", config.service))
        })?;

        let tls = match &config.tls {
            None => None,
            Some(tls_config) if tls_config.passthrough => Some((true, None)),
            Some(tls_config) => {
                let options = tls_config.options.as_deref().unwrap_or(DEFAULT_OPTIONS);
                let server_config = self.tls_manager.server_config(options)?;
                Some((false, Some(TlsAcceptor::from(server_config))))
            }
        };

        Ok((
            entry_points,
            CompiledTcpRouter {
                name: name.to_string(),
                priority: config.effective_priority(),
                rule,
                tls,
                service,
            },
        ))
    }
}
