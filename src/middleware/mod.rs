//! Middleware plane: materialises named middleware configurations into
//! handler wrappers.
//!
//! A router's middleware list is resolved name by name, `chain`
//! references are expanded in place with grey/black cycle detection, and
//! the service handler is wrapped in reverse order so the first listed
//! middleware runs outermost. Builders are pure functions of
//! `(config, next)`; all per-request state lives inside the returned
//! closures.

pub mod chain;
pub mod grpcweb;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use hyper::{Body, Request, Response, StatusCode};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::dynamic::{
    BackoffKind, BasicAuthConfig, HeadersConfig, MiddlewareConfig, RateLimitConfig, RetryConfig,
    StripPrefixConfig,
};
use crate::error::{FluxgateError, FluxgateResult};
use crate::service::forward::{self, buffer_body, ForwardContext};
use crate::service::HttpService;

type HandlerFuture = Pin<Box<dyn Future<Output = FluxgateResult<Response<Body>>> + Send>>;

/// A composable HTTP handler: middlewares wrap these, routers dispatch
/// to them.
#[derive(Clone)]
pub struct HttpHandler(
    Arc<dyn Fn(Request<Body>, ForwardContext) -> HandlerFuture + Send + Sync>,
);

impl std::fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHandler").finish()
    }
}

impl HttpHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Request<Body>, ForwardContext) -> HandlerFuture + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Terminal handler dispatching into a service tree.
    pub fn from_service(service: Arc<HttpService>) -> Self {
        Self::new(move |req, ctx| Arc::clone(&service).handle(req, ctx))
    }

    /// Handler returning a fixed status, used for rejections.
    pub fn fixed_status(status: StatusCode) -> Self {
        Self::new(move |_req, _ctx| {
            Box::pin(async move {
                Ok(Response::builder()
                    .status(status)
                    .body(Body::empty())
                    .expect("static response"))
            })
        })
    }

    pub fn call(&self, req: Request<Body>, ctx: ForwardContext) -> HandlerFuture {
        (self.0)(req, ctx)
    }
}

/// Builds middleware chains for one configuration generation.
pub struct MiddlewareBuilder {
    configs: HashMap<String, MiddlewareConfig>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Grey,
    Black,
}

impl MiddlewareBuilder {
    pub fn new(configs: HashMap<String, MiddlewareConfig>) -> Self {
        Self { configs }
    }

    /// Resolve a router's middleware list into a flat chain (expanding
    /// `chain` references) and wrap `service` with it. Any unresolved
    /// name or cycle fails the whole chain; the caller records the error
    /// on the router.
    pub fn build_chain(
        &self,
        names: &[String],
        service: HttpHandler,
    ) -> FluxgateResult<HttpHandler> {
        let mut flat: Vec<(String, &MiddlewareConfig)> = Vec::new();
        let mut marks: HashMap<String, Mark> = HashMap::new();
        for name in names {
            self.expand(name, &mut flat, &mut marks)?;
        }

        // Wrap in reverse order: the first listed middleware must run
        // outermost.
        let mut handler = service;
        for (name, config) in flat.into_iter().rev() {
            handler = build_middleware(&name, config, handler)?;
        }
        Ok(handler)
    }

    fn expand<'a>(
        &'a self,
        name: &str,
        flat: &mut Vec<(String, &'a MiddlewareConfig)>,
        marks: &mut HashMap<String, Mark>,
    ) -> FluxgateResult<()> {
        match marks.get(name) {
            Some(Mark::Grey) => {
                return Err(FluxgateError::config(format!(
                    "middleware cycle through \"{}\"",
                    name
                )))
            }
            Some(Mark::Black) | None => {}
        }

        let config = self.configs.get(name).ok_or_else(|| {
            FluxgateError::config(format!("middleware \"{}\" does not exist", name))
        })?;

        if let MiddlewareConfig::Chain(chain) = config {
            marks.insert(name.to_string(), Mark::Grey);
            for inner in &chain.middlewares {
                self.expand(inner, flat, marks)?;
            }
            marks.insert(name.to_string(), Mark::Black);
        } else {
            flat.push((name.to_string(), config));
            marks.insert(name.to_string(), Mark::Black);
        }
        Ok(())
    }
}

/// Materialise one middleware around `next`.
fn build_middleware(
    name: &str,
    config: &MiddlewareConfig,
    next: HttpHandler,
) -> FluxgateResult<HttpHandler> {
    match config {
        MiddlewareConfig::Chain(_) => {
            // Chains are expanded by the builder and never reach here.
            Err(FluxgateError::internal(format!(
                "chain middleware \"{}\" not expanded",
                name
            )))
        }
        MiddlewareConfig::BasicAuth(auth) => build_basic_auth(auth, next),
        MiddlewareConfig::StripPrefix(strip) => Ok(build_strip_prefix(strip.clone(), next)),
        MiddlewareConfig::Headers(headers) => Ok(build_headers(headers.clone(), next)),
        MiddlewareConfig::RateLimit(limit) => Ok(build_rate_limit(limit.clone(), next)),
        MiddlewareConfig::Retry(retry) => Ok(build_retry(name.to_string(), retry.clone(), next)),
        MiddlewareConfig::GrpcWeb(config) => Ok(grpcweb::build(config.clone(), next)),
    }
}

fn build_basic_auth(config: &BasicAuthConfig, next: HttpHandler) -> FluxgateResult<HttpHandler> {
    let mut users: HashMap<String, String> = HashMap::new();
    for entry in &config.users {
        let (user, hash) = entry.split_once(':').ok_or_else(|| {
            FluxgateError::config(format!("basic auth entry '{}' is not user:hash", entry))
        })?;
        users.insert(user.to_string(), hash.to_ascii_lowercase());
    }

    // The realm lands in a response header; reject values the header
    // grammar cannot carry here, so the error is recorded on the router
    // instead of surfacing on the first unauthenticated request.
    let challenge: hyper::header::HeaderValue = format!("Basic realm=\"{}\"", config.realm)
        .parse()
        .map_err(|_| {
            FluxgateError::config(format!(
                "basic auth realm '{}' is not a valid header value",
                config.realm.escape_debug()
            ))
        })?;

    Ok(HttpHandler::new(move |req, ctx| {
        let authorized = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|encoded| BASE64_STANDARD.decode(encoded).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|credentials| {
                let (user, password) = credentials.split_once(':')?;
                let digest = format!("{:x}", Sha256::digest(password.as_bytes()));
                (users.get(user) == Some(&digest)).then_some(())
            })
            .is_some();

        if authorized {
            next.call(req, ctx)
        } else {
            let challenge = challenge.clone();
            Box::pin(async move {
                Ok(Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .header(hyper::header::WWW_AUTHENTICATE, challenge)
                    .body(Body::empty())
                    .expect("static response"))
            })
        }
    }))
}

fn build_strip_prefix(config: StripPrefixConfig, next: HttpHandler) -> HttpHandler {
    HttpHandler::new(move |mut req, ctx| {
        for prefix in &config.prefixes {
            let path = req.uri().path();
            if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                let new_path = if rest.starts_with('/') {
                    rest.to_string()
                } else {
                    format!("/{}", rest)
                };
                let path_and_query = match req.uri().query() {
                    Some(query) => format!("{}?{}", new_path, query),
                    None => new_path,
                };

                let mut parts = req.uri().clone().into_parts();
                parts.path_and_query = path_and_query.parse().ok();
                if let Ok(new_uri) = hyper::Uri::from_parts(parts) {
                    if let Ok(value) = prefix.parse() {
                        req.headers_mut().insert("x-forwarded-prefix", value);
                    }
                    *req.uri_mut() = new_uri;
                }
                break;
            }
        }
        next.call(req, ctx)
    })
}

fn build_headers(config: HeadersConfig, next: HttpHandler) -> HttpHandler {
    let config = Arc::new(config);
    HttpHandler::new(move |mut req, ctx| {
        for (name, value) in &config.request {
            if let (Ok(name), Ok(value)) = (
                name.parse::<hyper::header::HeaderName>(),
                value.parse::<hyper::header::HeaderValue>(),
            ) {
                req.headers_mut().insert(name, value);
            }
        }

        let next = next.clone();
        let config = Arc::clone(&config);
        Box::pin(async move {
            let mut response = next.call(req, ctx).await?;
            for (name, value) in &config.response {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<hyper::header::HeaderName>(),
                    value.parse::<hyper::header::HeaderValue>(),
                ) {
                    response.headers_mut().insert(name, value);
                }
            }
            Ok(response)
        })
    })
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

fn build_rate_limit(config: RateLimitConfig, next: HttpHandler) -> HttpHandler {
    let burst = config.burst.max(1) as f64;
    let bucket = Arc::new(Mutex::new(TokenBucket {
        tokens: burst,
        last_refill: Instant::now(),
    }));

    HttpHandler::new(move |req, ctx| {
        let allowed = {
            let mut bucket = bucket.lock().expect("rate limit lock");
            let elapsed = bucket.last_refill.elapsed().as_secs_f64();
            bucket.last_refill = Instant::now();
            bucket.tokens = (bucket.tokens + elapsed * config.average as f64).min(burst);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                true
            } else {
                false
            }
        };

        if allowed {
            next.call(req, ctx)
        } else {
            Box::pin(async {
                Ok(Response::builder()
                    .status(StatusCode::TOO_MANY_REQUESTS)
                    .body(Body::empty())
                    .expect("static response"))
            })
        }
    })
}

fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = Duration::from_millis(config.base_ms);
    match config.backoff {
        BackoffKind::Fixed => base,
        BackoffKind::ExponentialJitter => {
            let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
            let jitter = rand::thread_rng().gen_range(0..=config.base_ms);
            exp + Duration::from_millis(jitter)
        }
    }
}

fn build_retry(name: String, config: RetryConfig, next: HttpHandler) -> HttpHandler {
    HttpHandler::new(move |req, ctx| {
        let next = next.clone();
        let config = config.clone();
        let name = name.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let mut buffered = buffer_body(body, config.max_body_size).await?;

            // Retries need a replayable body; anything else gets exactly
            // one attempt. Failures here happened before any response
            // byte reached the client, so replaying is safe.
            let attempts = if buffered.is_replayable() {
                config.attempts.max(1)
            } else {
                1
            };

            let mut last_error = None;
            for attempt in 1..=attempts {
                let mut attempt_req = Request::builder()
                    .method(parts.method.clone())
                    .uri(parts.uri.clone());
                if let Some(headers) = attempt_req.headers_mut() {
                    headers.extend(parts.headers.clone());
                }
                let attempt_req = attempt_req
                    .body(buffered.to_body())
                    .map_err(FluxgateError::from)?;

                match next.call(attempt_req, ctx.clone()).await {
                    Ok(response)
                        if attempt < attempts
                            && forward::is_transient_status(response.status()) =>
                    {
                        debug!(
                            middleware = %name,
                            attempt,
                            status = %response.status(),
                            "Retrying after transient upstream status"
                        );
                        crate::observe::retry(&name);
                        tokio::time::sleep(retry_delay(&config, attempt)).await;
                    }
                    Ok(response) => return Ok(response),
                    Err(e) if attempt < attempts && e.is_transient() => {
                        warn!(middleware = %name, attempt, error = %e, "Retrying request");
                        crate::observe::retry(&name);
                        last_error = Some(e);
                        tokio::time::sleep(retry_delay(&config, attempt)).await;
                    }
                    Err(e) => return Err(e),
                }
            }

            Err(last_error.unwrap_or_else(|| {
                FluxgateError::service_unavailable("retries exhausted")
            }))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn echo_handler() -> HttpHandler {
        HttpHandler::new(|req, _ctx| {
            Box::pin(async move {
                Ok(Response::builder()
                    .header("x-echo-path", req.uri().path_and_query().unwrap().as_str())
                    .header(
                        "x-echo-auth",
                        req.headers()
                            .get("x-test-injected")
                            .cloned()
                            .unwrap_or_else(|| "none".parse().unwrap()),
                    )
                    .body(Body::empty())
                    .unwrap())
            })
        })
    }

    fn builder(toml_str: &str) -> MiddlewareBuilder {
        MiddlewareBuilder::new(toml::from_str(toml_str).unwrap())
    }

    #[tokio::test]
    async fn test_strip_prefix() {
        let b = builder(
            r#"
[strip.strip_prefix]
prefixes = ["/api"]
"#,
        );
        let chain = b
            .build_chain(&["strip".to_string()], echo_handler())
            .unwrap();

        let req = Request::builder()
            .uri("http://a.test/api/users?x=1")
            .body(Body::empty())
            .unwrap();
        let resp = chain.call(req, ForwardContext::default()).await.unwrap();
        assert_eq!(resp.headers()["x-echo-path"], "/users?x=1");

        // Non-matching path passes through untouched.
        let req = Request::builder()
            .uri("http://a.test/other")
            .body(Body::empty())
            .unwrap();
        let resp = chain.call(req, ForwardContext::default()).await.unwrap();
        assert_eq!(resp.headers()["x-echo-path"], "/other");
    }

    #[tokio::test]
    async fn test_headers_request_and_response() {
        let b = builder(
            r#"
[hdrs.headers]
request = { "x-test-injected" = "yes" }
response = { "x-powered-by" = "fluxgate" }
"#,
        );
        let chain = b
            .build_chain(&["hdrs".to_string()], echo_handler())
            .unwrap();

        let req = Request::builder()
            .uri("http://a.test/")
            .body(Body::empty())
            .unwrap();
        let resp = chain.call(req, ForwardContext::default()).await.unwrap();
        assert_eq!(resp.headers()["x-echo-auth"], "yes");
        assert_eq!(resp.headers()["x-powered-by"], "fluxgate");
    }

    #[tokio::test]
    async fn test_basic_auth() {
        // sha256("secret")
        let b = builder(
            r#"
[auth.basic_auth]
users = ["admin:2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"]
"#,
        );
        let chain = b
            .build_chain(&["auth".to_string()], echo_handler())
            .unwrap();

        // No credentials.
        let req = Request::builder()
            .uri("http://a.test/")
            .body(Body::empty())
            .unwrap();
        let resp = chain.call(req, ForwardContext::default()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key("www-authenticate"));

        // Valid credentials.
        let credentials = BASE64_STANDARD.encode("admin:secret");
        let req = Request::builder()
            .uri("http://a.test/")
            .header("authorization", format!("Basic {}", credentials))
            .body(Body::empty())
            .unwrap();
        let resp = chain.call(req, ForwardContext::default()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Wrong password.
        let credentials = BASE64_STANDARD.encode("admin:guess");
        let req = Request::builder()
            .uri("http://a.test/")
            .header("authorization", format!("Basic {}", credentials))
            .body(Body::empty())
            .unwrap();
        let resp = chain.call(req, ForwardContext::default()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_rate_limit_burst() {
        let b = builder(
            r#"
[limit.rate_limit]
average = 1
burst = 2
"#,
        );
        let chain = b
            .build_chain(&["limit".to_string()], echo_handler())
            .unwrap();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let req = Request::builder()
                .uri("http://a.test/")
                .body(Body::empty())
                .unwrap();
            statuses.push(chain.call(req, ForwardContext::default()).await.unwrap().status());
        }
        assert_eq!(statuses[0], StatusCode::OK);
        assert_eq!(statuses[1], StatusCode::OK);
        assert_eq!(statuses[2], StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let flaky = HttpHandler::new(|_req, _ctx| {
            Box::pin(async {
                if CALLS.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FluxgateError::network("connection reset"))
                } else {
                    Ok(Response::new(Body::from("recovered")))
                }
            })
        });

        let b = builder(
            r#"
[retry.retry]
attempts = 3
base_ms = 1
backoff = "fixed"
"#,
        );
        let chain = b.build_chain(&["retry".to_string()], flaky).unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("http://a.test/")
            .body(Body::from("idempotent-ish"))
            .unwrap();
        let resp = chain.call(req, ForwardContext::default()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_non_transient_error() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let broken = HttpHandler::new(|_req, _ctx| {
            Box::pin(async {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Err(FluxgateError::client("bad request"))
            })
        });

        let b = builder(
            r#"
[retry.retry]
attempts = 5
base_ms = 1
"#,
        );
        let chain = b.build_chain(&["retry".to_string()], broken).unwrap();

        let req = Request::builder()
            .uri("http://a.test/")
            .body(Body::empty())
            .unwrap();
        let err = chain.call(req, ForwardContext::default()).await.unwrap_err();
        assert!(matches!(err, FluxgateError::Client { .. }));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chain_expansion_order() {
        // The first middleware in the chain runs outermost: "outer" sets
        // a request header that "inner" (strip) does not disturb, and
        // both effects land.
        let b = builder(
            r#"
[all.chain]
middlewares = ["hdrs", "strip"]

[hdrs.headers]
request = { "x-test-injected" = "chained" }

[strip.strip_prefix]
prefixes = ["/v1"]
"#,
        );
        let chain = b.build_chain(&["all".to_string()], echo_handler()).unwrap();

        let req = Request::builder()
            .uri("http://a.test/v1/things")
            .body(Body::empty())
            .unwrap();
        let resp = chain.call(req, ForwardContext::default()).await.unwrap();
        assert_eq!(resp.headers()["x-echo-path"], "/things");
        assert_eq!(resp.headers()["x-echo-auth"], "chained");
    }

    #[test]
    fn test_chain_cycle_detected() {
        let b = builder(
            r#"
[m1.chain]
middlewares = ["m2"]

[m2.chain]
middlewares = ["m1"]
"#,
        );
        let err = b
            .build_chain(&["m1".to_string()], echo_handler())
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_cycle_detected() {
        let b = builder(
            r#"
[m1.chain]
middlewares = ["m1"]
"#,
        );
        assert!(b.build_chain(&["m1".to_string()], echo_handler()).is_err());
    }

    #[test]
    fn test_diamond_reference_is_not_a_cycle() {
        // m1 and m2 both reference shared; that is a DAG, not a cycle.
        let b = builder(
            r#"
[all.chain]
middlewares = ["m1", "m2"]

[m1.chain]
middlewares = ["shared"]

[m2.chain]
middlewares = ["shared"]

[shared.strip_prefix]
prefixes = ["/x"]
"#,
        );
        assert!(b.build_chain(&["all".to_string()], echo_handler()).is_ok());
    }

    #[test]
    fn test_unknown_middleware() {
        let b = builder("");
        let err = b
            .build_chain(&["ghost".to_string()], echo_handler())
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_invalid_basic_auth_entry() {
        let b = builder(
            r#"
[auth.basic_auth]
users = ["missing-colon"]
"#,
        );
        assert!(b.build_chain(&["auth".to_string()], echo_handler()).is_err());
    }

    #[test]
    fn test_basic_auth_realm_rejected_when_not_a_header_value() {
        // A CR/LF in the realm would otherwise break the
        // WWW-Authenticate header on every 401; it must fail the chain
        // build as a config error instead.
        let b = builder(
            "[auth.basic_auth]\nusers = []\nrealm = \"my\\r\\ninjected\"\n",
        );
        let err = b
            .build_chain(&["auth".to_string()], echo_handler())
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("realm"));
    }
}
