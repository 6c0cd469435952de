//! Dynamic configuration model.
//!
//! One [`DynamicConfig`] is the unit a provider delivers; the aggregator
//! merges the latest message from each provider into a single snapshot
//! under namespaced entity names (`name@provider`). Snapshots are
//! immutable once built.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Full dynamic configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub udp: UdpConfig,
    /// Named outbound dial configurations
    #[serde(default)]
    pub transports: HashMap<String, TransportConfig>,
    #[serde(default)]
    pub tls: TlsDynamicConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub routers: HashMap<String, RouterConfig>,
    #[serde(default)]
    pub middlewares: HashMap<String, MiddlewareConfig>,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default)]
    pub routers: HashMap<String, TcpRouterConfig>,
    #[serde(default)]
    pub services: HashMap<String, TcpServiceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UdpConfig {
    #[serde(default)]
    pub routers: HashMap<String, UdpRouterConfig>,
    #[serde(default)]
    pub services: HashMap<String, UdpServiceConfig>,
}

/// An HTTP router: rule + entry points + middleware chain + service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Entry points this router listens on; empty means all TCP entry points
    #[serde(default)]
    pub entry_points: Vec<String>,
    /// Matching rule, e.g. `Host(`a.test`) && PathPrefix(`/api`)`
    pub rule: String,
    /// Match priority; defaults to the rule string length
    #[serde(default)]
    pub priority: Option<i64>,
    /// Ordered middleware references; the first listed runs outermost
    #[serde(default)]
    pub middlewares: Vec<String>,
    /// Service reference
    pub service: String,
    /// Presence makes the router TLS-only
    #[serde(default)]
    pub tls: Option<RouterTlsConfig>,
}

impl RouterConfig {
    /// Effective priority: explicit value, or the rule length.
    pub fn effective_priority(&self) -> i64 {
        self.priority.unwrap_or(self.rule.len() as i64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterTlsConfig {
    /// Named TLS options reference
    #[serde(default)]
    pub options: Option<String>,
}

/// A TCP router matched by SNI/ALPN/client IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpRouterConfig {
    #[serde(default)]
    pub entry_points: Vec<String>,
    /// Matching rule, e.g. `HostSNI(`db.test`)`
    pub rule: String,
    #[serde(default)]
    pub priority: Option<i64>,
    pub service: String,
    #[serde(default)]
    pub tls: Option<TcpRouterTlsConfig>,
}

impl TcpRouterConfig {
    pub fn effective_priority(&self) -> i64 {
        self.priority.unwrap_or(self.rule.len() as i64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpRouterTlsConfig {
    /// Forward the raw TLS stream without terminating
    #[serde(default)]
    pub passthrough: bool,
    #[serde(default)]
    pub options: Option<String>,
}

/// A UDP router: no rule language, keyed by entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpRouterConfig {
    #[serde(default)]
    pub entry_points: Vec<String>,
    pub service: String,
}

/// HTTP service variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceConfig {
    /// Round-robin over healthy servers, weighted
    LoadBalancer(LoadBalancerConfig),
    /// Probabilistic selection among sub-services
    Weighted(WeightedConfig),
    /// Primary plus fire-and-forget mirrors
    Mirroring(MirroringConfig),
    /// Primary with a single fallback on classified failure
    Failover(FailoverConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub sticky: Option<StickyConfig>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    /// Named transport reference
    #[serde(default)]
    pub transport: Option<String>,
    /// Forward the client's Host header instead of the upstream authority
    #[serde(default)]
    pub pass_host_header: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Upstream base URL, e.g. "http://10.0.0.3:8080"
    pub url: String,
    /// Relative weight, default 1
    #[serde(default)]
    pub weight: Option<u32>,
}

impl ServerConfig {
    pub fn effective_weight(&self) -> u32 {
        self.weight.unwrap_or(1).max(1)
    }
}

/// Sticky-session cookie configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickyConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_http_only")]
    pub http_only: bool,
}

fn default_cookie_name() -> String {
    "fluxgate_affinity".to_string()
}

fn default_http_only() -> bool {
    true
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            secure: false,
            http_only: true,
        }
    }
}

/// Per-server health probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Probe period, seconds
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    /// Per-probe timeout, seconds
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
    /// Accepted status codes; empty means any 2xx/3xx
    #[serde(default)]
    pub status: Vec<u16>,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            status: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightedConfig {
    pub services: Vec<WeightedServiceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedServiceRef {
    pub name: String,
    #[serde(default)]
    pub weight: Option<u32>,
}

impl WeightedServiceRef {
    pub fn effective_weight(&self) -> u32 {
        self.weight.unwrap_or(1).max(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirroringConfig {
    /// Primary service reference
    pub service: String,
    #[serde(default)]
    pub mirrors: Vec<MirrorRef>,
    /// Largest request body replayed to mirrors, bytes
    #[serde(default = "default_mirror_body_cap")]
    pub max_body_size: u64,
}

fn default_mirror_body_cap() -> u64 {
    1024 * 1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRef {
    pub name: String,
    /// Share of requests mirrored, 0-100, default 100
    #[serde(default)]
    pub percent: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailoverConfig {
    pub service: String,
    pub fallback: String,
}

/// HTTP middleware variants. The first listed on a router runs outermost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareConfig {
    /// `user:sha256hex` credential pairs
    BasicAuth(BasicAuthConfig),
    /// Reference to further middlewares, expanded in place
    Chain(ChainConfig),
    StripPrefix(StripPrefixConfig),
    Headers(HeadersConfig),
    RateLimit(RateLimitConfig),
    Retry(RetryConfig),
    GrpcWeb(GrpcWebConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicAuthConfig {
    /// Entries of the form "user:sha256(password) in hex"
    pub users: Vec<String>,
    #[serde(default = "default_realm")]
    pub realm: String,
}

fn default_realm() -> String {
    "fluxgate".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub middlewares: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StripPrefixConfig {
    pub prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadersConfig {
    /// Headers set on the request before forwarding
    #[serde(default)]
    pub request: HashMap<String, String>,
    /// Headers set on the response before returning
    #[serde(default)]
    pub response: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained requests per second
    pub average: u64,
    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u64,
}

fn default_burst() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub attempts: u32,
    /// Base delay between attempts, milliseconds
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Largest request body buffered for replay, bytes
    #[serde(default = "default_retry_body_cap")]
    pub max_body_size: u64,
}

fn default_retry_base_ms() -> u64 {
    100
}

fn default_retry_body_cap() -> u64 {
    64 * 1024
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    #[default]
    ExponentialJitter,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpcWebConfig {
    /// Origins allowed by the CORS policy; "*" allows any
    #[serde(default)]
    pub allow_origins: Vec<String>,
}

/// TCP service variants (load balancer only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpServiceConfig {
    LoadBalancer(TcpLoadBalancerConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpLoadBalancerConfig {
    pub servers: Vec<TcpServerConfig>,
    #[serde(default)]
    pub transport: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpServerConfig {
    /// Upstream address, "host:port"
    pub address: String,
}

/// UDP service variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UdpServiceConfig {
    LoadBalancer(UdpLoadBalancerConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UdpLoadBalancerConfig {
    pub servers: Vec<TcpServerConfig>,
}

/// Named outbound dial configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Dial timeout, seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    /// TCP keepalive period, seconds (0 disables)
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    /// Idle connection cap per upstream host
    #[serde(default = "default_max_idle")]
    pub max_idle_conns_per_host: usize,
    /// Response header timeout for HTTP upstreams, seconds (0 = unlimited)
    #[serde(default)]
    pub response_header_timeout: u64,
    #[serde(default)]
    pub tls: Option<TransportTlsConfig>,
    /// Send a PROXY protocol v1 header on connect
    #[serde(default)]
    pub proxy_protocol: bool,
}

fn default_dial_timeout() -> u64 {
    30
}

fn default_keep_alive() -> u64 {
    15
}

fn default_max_idle() -> usize {
    32
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: default_dial_timeout(),
            keep_alive: default_keep_alive(),
            max_idle_conns_per_host: default_max_idle(),
            response_header_timeout: 0,
            tls: None,
            proxy_protocol: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportTlsConfig {
    /// Skip upstream certificate verification (private upstreams)
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// SNI override for the upstream handshake
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Dynamic TLS material: certificates, options, stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsDynamicConfig {
    #[serde(default)]
    pub certificates: Vec<CertificateConfig>,
    #[serde(default)]
    pub options: HashMap<String, TlsOptionConfig>,
    #[serde(default)]
    pub stores: HashMap<String, TlsStoreConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateConfig {
    pub cert_file: String,
    pub key_file: String,
    /// Server names this certificate covers; `*.example.com` matches one
    /// extra label
    pub domains: Vec<String>,
    /// Stores this certificate belongs to; empty means the default store
    #[serde(default)]
    pub stores: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsOptionConfig {
    /// Minimum TLS version, "1.2" or "1.3"
    #[serde(default)]
    pub min_version: Option<String>,
    /// ALPN protocols offered, e.g. ["h2", "http/1.1"]
    #[serde(default)]
    pub alpn_protocols: Vec<String>,
    #[serde(default)]
    pub client_auth: Option<ClientAuthConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientAuthConfig {
    /// PEM bundles of accepted client CAs
    pub ca_files: Vec<String>,
    #[serde(default)]
    pub policy: ClientAuthPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthPolicy {
    #[default]
    NoClientCert,
    RequestClientCert,
    VerifyIfGiven,
    RequireAndVerify,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsStoreConfig {
    #[serde(default)]
    pub default_certificate: Option<DefaultCertificateConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultCertificateConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_dynamic_config() {
        let toml_str = r#"
[http.routers.api]
entry_points = ["web"]
rule = 'Host(`a.test`) && PathPrefix(`/api`)'
middlewares = ["auth"]
service = "backend"

[http.routers.site]
rule = 'Host(`a.test`)'
service = "backend"
priority = 5

[http.middlewares.auth.basic_auth]
users = ["admin:8c6976e5b5410415bde908bd4dee15dfb167a9c873fc4bb8a81f6f2ab448a918"]

[http.services.backend.load_balancer]
servers = [{ url = "http://127.0.0.1:3000" }, { url = "http://127.0.0.1:3001", weight = 2 }]

[http.services.backend.load_balancer.sticky]
cookie_name = "lb"

[http.services.backend.load_balancer.health_check]
path = "/ping"
interval = 5

[tcp.routers.db]
entry_points = ["postgres"]
rule = 'HostSNI(`db.test`)'
service = "pg"

[tcp.routers.db.tls]
passthrough = true

[tcp.services.pg.load_balancer]
servers = [{ address = "127.0.0.1:5432" }]

[udp.routers.dns]
entry_points = ["dns"]
service = "resolvers"

[udp.services.resolvers.load_balancer]
servers = [{ address = "127.0.0.1:5353" }]

[transports.fast]
dial_timeout = 2
max_idle_conns_per_host = 8

[[tls.certificates]]
cert_file = "certs/a.test.crt"
key_file = "certs/a.test.key"
domains = ["a.test", "*.a.test"]

[tls.options.mtls.client_auth]
ca_files = ["certs/clients-ca.pem"]
policy = "require_and_verify"
"#;

        let config: DynamicConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.http.routers.len(), 2);
        let api = &config.http.routers["api"];
        assert_eq!(api.entry_points, vec!["web"]);
        assert_eq!(api.middlewares, vec!["auth"]);
        assert_eq!(api.effective_priority(), api.rule.len() as i64);
        assert_eq!(config.http.routers["site"].effective_priority(), 5);

        match &config.http.services["backend"] {
            ServiceConfig::LoadBalancer(lb) => {
                assert_eq!(lb.servers.len(), 2);
                assert_eq!(lb.servers[0].effective_weight(), 1);
                assert_eq!(lb.servers[1].effective_weight(), 2);
                assert_eq!(lb.sticky.as_ref().unwrap().cookie_name, "lb");
                assert_eq!(lb.health_check.as_ref().unwrap().interval, 5);
            }
            other => panic!("expected load balancer, got {:?}", other),
        }

        let db = &config.tcp.routers["db"];
        assert!(db.tls.as_ref().unwrap().passthrough);

        assert_eq!(config.transports["fast"].dial_timeout, 2);
        assert_eq!(config.transports["fast"].keep_alive, 15);

        assert_eq!(config.tls.certificates.len(), 1);
        let mtls = &config.tls.options["mtls"];
        assert_eq!(
            mtls.client_auth.as_ref().unwrap().policy,
            ClientAuthPolicy::RequireAndVerify
        );
    }

    #[test]
    fn test_middleware_variants() {
        let toml_str = r#"
[chain_all.chain]
middlewares = ["strip", "retry"]

[strip.strip_prefix]
prefixes = ["/api"]

[retry.retry]
attempts = 3
backoff = "fixed"

[limit.rate_limit]
average = 100
burst = 50

[grpc.grpc_web]
allow_origins = ["*"]
"#;

        let middlewares: HashMap<String, MiddlewareConfig> = toml::from_str(toml_str).unwrap();

        assert!(matches!(
            middlewares["chain_all"],
            MiddlewareConfig::Chain(_)
        ));
        assert!(matches!(middlewares["strip"], MiddlewareConfig::StripPrefix(_)));
        match &middlewares["retry"] {
            MiddlewareConfig::Retry(r) => {
                assert_eq!(r.attempts, 3);
                assert_eq!(r.backoff, BackoffKind::Fixed);
                assert_eq!(r.base_ms, 100);
            }
            other => panic!("expected retry, got {:?}", other),
        }
        match &middlewares["limit"] {
            MiddlewareConfig::RateLimit(r) => {
                assert_eq!(r.average, 100);
                assert_eq!(r.burst, 50);
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
        match &middlewares["grpc"] {
            MiddlewareConfig::GrpcWeb(g) => assert_eq!(g.allow_origins, vec!["*"]),
            other => panic!("expected grpc web, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_equality_detects_change() {
        let a: DynamicConfig = toml::from_str(
            r#"
[http.routers.r]
rule = 'Path(`/x`)'
service = "s"
"#,
        )
        .unwrap();
        let mut b = a.clone();
        assert_eq!(a, b);

        b.http.routers.get_mut("r").unwrap().priority = Some(7);
        assert_ne!(a, b);
    }
}
