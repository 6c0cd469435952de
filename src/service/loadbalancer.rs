//! Weighted round-robin load balancing with sticky sessions.
//!
//! Selection only considers servers whose health cell reports available.
//! Sticky sessions pin a client to a server through an HMAC-signed
//! cookie; the signature is over the server URL with a per-service
//! secret, so the cookie value is opaque and cannot be forged to point at
//! an arbitrary upstream. A pinned server is honoured only while
//! healthy; otherwise the balancer falls back to round-robin and rewrites
//! the cookie.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hyper::{Body, Request, Response};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::config::dynamic::StickyConfig;
use crate::error::{FluxgateError, FluxgateResult};
use crate::service::forward::{self, ForwardContext, HttpsClient};
use crate::service::health::ServerCell;

/// One upstream server with its live health cell.
pub struct Server {
    pub url: String,
    pub weight: u32,
    pub cell: Arc<ServerCell>,
}

/// Result of a balancing decision.
#[derive(Debug, PartialEq)]
pub struct Selection {
    pub url: String,
    /// New cookie to set on the response, when sticky is configured and
    /// the pin changed
    pub set_cookie: Option<String>,
}

struct Sticky {
    config: StickyConfig,
    secret: [u8; 32],
}

/// Round-robin load balancer over health-checked servers.
pub struct LoadBalancerService {
    name: String,
    servers: Vec<Server>,
    counter: AtomicUsize,
    sticky: Option<Sticky>,
    pass_host_header: bool,
    client: HttpsClient,
    header_timeout: Option<Duration>,
}

impl LoadBalancerService {
    pub fn new(
        name: String,
        servers: Vec<Server>,
        sticky: Option<(StickyConfig, [u8; 32])>,
        pass_host_header: bool,
        client: HttpsClient,
        header_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name,
            servers,
            counter: AtomicUsize::new(0),
            sticky: sticky.map(|(config, secret)| Sticky { config, secret }),
            pass_host_header,
            client,
            header_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_urls(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.url.clone()).collect()
    }

    /// Pick a server for a request carrying `cookie_value` (if any).
    pub fn choose(&self, cookie_value: Option<&str>) -> FluxgateResult<Selection> {
        if let (Some(sticky), Some(value)) = (&self.sticky, cookie_value) {
            // A cookie pins its server iff that server is still healthy.
            if let Some(server) = self
                .servers
                .iter()
                .filter(|s| s.cell.is_available())
                .find(|s| sticky_value(&sticky.secret, &s.url) == value)
            {
                return Ok(Selection {
                    url: server.url.clone(),
                    set_cookie: None,
                });
            }
            debug!(service = %self.name, "Sticky cookie no longer pins a healthy server");
        }

        let server = self.pick_round_robin().ok_or_else(|| {
            FluxgateError::service_unavailable(format!(
                "no healthy servers in service '{}'",
                self.name
            ))
        })?;

        let set_cookie = self
            .sticky
            .as_ref()
            .map(|sticky| build_cookie(&sticky.config, &sticky_value(&sticky.secret, &server.url)));

        Ok(Selection {
            url: server.url.clone(),
            set_cookie,
        })
    }

    /// Weighted round-robin over the currently available servers.
    fn pick_round_robin(&self) -> Option<&Server> {
        let available: Vec<&Server> = self
            .servers
            .iter()
            .filter(|s| s.cell.is_available())
            .collect();
        if available.is_empty() {
            return None;
        }

        let total_weight: u32 = available.iter().map(|s| s.weight).sum();
        let tick = self.counter.fetch_add(1, Ordering::Relaxed) as u32;
        let mut position = tick % total_weight.max(1);

        for &server in &available {
            if position < server.weight {
                return Some(server);
            }
            position -= server.weight;
        }
        available.first().copied()
    }

    /// Balance and forward one request.
    pub async fn handle(
        &self,
        req: Request<Body>,
        ctx: &ForwardContext,
    ) -> FluxgateResult<Response<Body>> {
        let cookie_value = self.sticky.as_ref().and_then(|sticky| {
            read_cookie(req.headers(), &sticky.config.cookie_name)
        });

        let selection = self.choose(cookie_value.as_deref())?;

        let mut response = forward::forward(
            req,
            &selection.url,
            &self.client,
            self.header_timeout,
            ctx,
            self.pass_host_header,
        )
        .await?;

        if let Some(cookie) = selection.set_cookie {
            if let Ok(value) = cookie.parse() {
                response
                    .headers_mut()
                    .append(hyper::header::SET_COOKIE, value);
            }
        }

        Ok(response)
    }
}

/// Opaque, signed identifier of a server for the sticky cookie.
fn sticky_value(secret: &[u8; 32], server_url: &str) -> String {
    URL_SAFE_NO_PAD.encode(hmac_sha256(secret, server_url.as_bytes()))
}

fn build_cookie(config: &StickyConfig, value: &str) -> String {
    let mut cookie = format!("{}={}; Path=/", config.cookie_name, value);
    if config.http_only {
        cookie.push_str("; HttpOnly");
    }
    if config.secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Extract a cookie value from request headers.
pub fn read_cookie(headers: &hyper::HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(hyper::header::COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// HMAC-SHA256 over `msg` with `key`.
fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    const BLOCK_SIZE: usize = 64;

    let mut key_block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        let digest = Sha256::digest(key);
        key_block[..digest.len()].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    let ipad: Vec<u8> = key_block.iter().map(|b| b ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(msg);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    let opad: Vec<u8> = key_block.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_hash);
    outer.finalize().into()
}

/// Per-service sticky secrets, carried across reloads iff the service's
/// identity (name + server set + sticky config) is unchanged.
#[derive(Default)]
pub struct StickyRegistry {
    entries: Mutex<HashMap<String, (String, [u8; 32])>>,
}

impl StickyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the secret for a service identity, minting a fresh one when
    /// the identity changed (which invalidates outstanding cookies).
    pub fn attach(&self, service_name: &str, identity: String) -> [u8; 32] {
        let mut entries = self.entries.lock().expect("sticky registry lock");
        match entries.get(service_name) {
            Some((existing, secret)) if *existing == identity => *secret,
            _ => {
                let secret: [u8; 32] = rand::random();
                entries.insert(service_name.to_string(), (identity, secret));
                secret
            }
        }
    }

    pub fn retain(&self, live_services: &[String]) {
        self.entries
            .lock()
            .expect("sticky registry lock")
            .retain(|name, _| live_services.iter().any(|s| s == name));
    }
}

/// Canonical identity string of a load-balancer service.
pub fn service_identity(
    name: &str,
    server_urls: &[String],
    sticky: &Option<StickyConfig>,
) -> String {
    let mut urls = server_urls.to_vec();
    urls.sort();
    format!("{}|{}|{:?}", name, urls.join(","), sticky)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::health::HealthRegistry;

    fn test_client() -> HttpsClient {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        hyper::Client::builder().build::<_, Body>(https)
    }

    fn balancer(urls_and_weights: &[(&str, u32)]) -> (LoadBalancerService, Vec<Arc<ServerCell>>) {
        let registry = HealthRegistry::new();
        let urls: Vec<String> = urls_and_weights.iter().map(|(u, _)| u.to_string()).collect();
        let cells = registry.attach("svc", &urls);
        // Probes have not run; mark everything healthy explicitly.
        for cell in &cells {
            cell.record(true);
        }

        let servers = urls_and_weights
            .iter()
            .zip(cells.iter())
            .map(|((url, weight), cell)| Server {
                url: url.to_string(),
                weight: *weight,
                cell: Arc::clone(cell),
            })
            .collect();

        (
            LoadBalancerService::new(
                "svc".to_string(),
                servers,
                None,
                false,
                test_client(),
                None,
            ),
            cells,
        )
    }

    #[test]
    fn test_round_robin_cycles_evenly() {
        let (lb, _) = balancer(&[("http://a", 1), ("http://b", 1)]);

        let picks: Vec<String> = (0..4).map(|_| lb.choose(None).unwrap().url).collect();
        assert_eq!(picks, vec!["http://a", "http://b", "http://a", "http://b"]);
    }

    #[test]
    fn test_weighted_distribution() {
        let (lb, _) = balancer(&[("http://a", 3), ("http://b", 1)]);

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..40 {
            *counts.entry(lb.choose(None).unwrap().url).or_default() += 1;
        }
        assert_eq!(counts["http://a"], 30);
        assert_eq!(counts["http://b"], 10);
    }

    #[test]
    fn test_skips_unhealthy_servers() {
        let (lb, cells) = balancer(&[("http://a", 1), ("http://b", 1)]);
        cells[0].record(false);
        cells[0].record(false);

        for _ in 0..4 {
            assert_eq!(lb.choose(None).unwrap().url, "http://b");
        }
    }

    #[test]
    fn test_all_unhealthy_is_service_unavailable() {
        let (lb, cells) = balancer(&[("http://a", 1)]);
        cells[0].record(false);
        cells[0].record(false);

        let err = lb.choose(None).unwrap_err();
        assert!(matches!(err, FluxgateError::ServiceUnavailable { .. }));
        assert!(err.is_transient());
    }

    fn sticky_balancer() -> (LoadBalancerService, Vec<Arc<ServerCell>>) {
        let registry = HealthRegistry::new();
        let urls = vec!["http://a".to_string(), "http://b".to_string()];
        let cells = registry.attach("svc", &urls);
        for cell in &cells {
            cell.record(true);
        }

        let servers = urls
            .iter()
            .zip(cells.iter())
            .map(|(url, cell)| Server {
                url: url.clone(),
                weight: 1,
                cell: Arc::clone(cell),
            })
            .collect();

        let lb = LoadBalancerService::new(
            "svc".to_string(),
            servers,
            Some((StickyConfig::default(), [42u8; 32])),
            false,
            test_client(),
            None,
        );
        (lb, cells)
    }

    #[test]
    fn test_sticky_pins_healthy_server() {
        let (lb, _) = sticky_balancer();

        let first = lb.choose(None).unwrap();
        let cookie = first.set_cookie.expect("sticky sets a cookie");
        let value = cookie
            .split(';')
            .next()
            .unwrap()
            .split_once('=')
            .unwrap()
            .1
            .to_string();

        // Subsequent requests with the cookie stay on the same server and
        // no new cookie is issued.
        for _ in 0..5 {
            let pinned = lb.choose(Some(&value)).unwrap();
            assert_eq!(pinned.url, first.url);
            assert!(pinned.set_cookie.is_none());
        }
    }

    #[test]
    fn test_sticky_falls_back_when_pinned_server_dies() {
        let (lb, cells) = sticky_balancer();

        let first = lb.choose(None).unwrap();
        let cookie_value = {
            let cookie = first.set_cookie.unwrap();
            cookie
                .split(';')
                .next()
                .unwrap()
                .split_once('=')
                .unwrap()
                .1
                .to_string()
        };

        // Kill the pinned server.
        let index = if first.url == "http://a" { 0 } else { 1 };
        cells[index].record(false);
        cells[index].record(false);

        let rerouted = lb.choose(Some(&cookie_value)).unwrap();
        assert_ne!(rerouted.url, first.url);
        // The cookie is rewritten for the new server.
        assert!(rerouted.set_cookie.is_some());
    }

    #[test]
    fn test_forged_cookie_is_ignored() {
        let (lb, _) = sticky_balancer();
        // A fabricated value matches no HMAC, so round-robin applies and
        // a fresh cookie is issued.
        let result = lb.choose(Some("forged-value")).unwrap();
        assert!(result.set_cookie.is_some());
    }

    #[test]
    fn test_hmac_sha256_vector() {
        // RFC 4231 test case 2.
        let out = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex(&out),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn test_cookie_parsing() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(
            hyper::header::COOKIE,
            "theme=dark; fluxgate_affinity=abc123; lang=en".parse().unwrap(),
        );
        assert_eq!(
            read_cookie(&headers, "fluxgate_affinity"),
            Some("abc123".to_string())
        );
        assert_eq!(read_cookie(&headers, "missing"), None);
    }

    #[test]
    fn test_sticky_registry_identity() {
        let registry = StickyRegistry::new();
        let identity = service_identity(
            "svc",
            &["http://a".to_string(), "http://b".to_string()],
            &Some(StickyConfig::default()),
        );

        let first = registry.attach("svc", identity.clone());
        let second = registry.attach("svc", identity.clone());
        assert_eq!(first, second);

        // Server order does not change identity.
        let reordered = service_identity(
            "svc",
            &["http://b".to_string(), "http://a".to_string()],
            &Some(StickyConfig::default()),
        );
        assert_eq!(identity, reordered);

        // A changed server set mints a new secret.
        let changed = service_identity(
            "svc",
            &["http://a".to_string(), "http://c".to_string()],
            &Some(StickyConfig::default()),
        );
        let third = registry.attach("svc", changed);
        assert_ne!(first, third);
    }
}
