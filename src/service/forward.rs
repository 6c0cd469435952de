//! Upstream HTTP forwarding.
//!
//! One shared code path rewrites the request URI onto the target base,
//! strips hop-by-hop headers, stamps forwarding headers and sends the
//! request through the transport's pooled client. Bodies can be buffered
//! up to a cap so retry/failover/mirroring can replay them.

use hyper::body::{Bytes, HttpBody as _};
use hyper::client::HttpConnector;
use hyper::{Body, Request, Response, Uri};
use std::net::IpAddr;
use std::time::Duration;

use crate::error::{FluxgateError, FluxgateResult};

pub type HttpsClient = hyper::Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

/// Per-request forwarding context threaded through the service tree.
#[derive(Debug, Clone, Default)]
pub struct ForwardContext {
    pub client_ip: Option<IpAddr>,
    /// Scheme the client used on the entry point
    pub client_scheme: &'static str,
}

/// Forward a request to `target_base`, preserving path and query.
pub async fn forward(
    mut req: Request<Body>,
    target_base: &str,
    client: &HttpsClient,
    header_timeout: Option<Duration>,
    ctx: &ForwardContext,
    pass_host_header: bool,
) -> FluxgateResult<Response<Body>> {
    let base: Uri = target_base
        .parse()
        .map_err(|e| FluxgateError::proxy(format!("invalid target url '{}': {}", target_base, e)))?;

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base
        .authority()
        .ok_or_else(|| {
            FluxgateError::proxy(format!("target URI missing authority: {}", target_base))
        })?
        .clone();

    let base_path = base.path().trim_end_matches('/');
    let new_uri: Uri = format!("{}://{}{}{}", scheme, authority, base_path, path_and_query)
        .parse()
        .map_err(|e| FluxgateError::proxy(format!("invalid upstream uri: {}", e)))?;

    *req.uri_mut() = new_uri;
    strip_hop_by_hop_headers(req.headers_mut());

    if !pass_host_header {
        req.headers_mut().insert(
            hyper::header::HOST,
            authority
                .as_str()
                .parse()
                .map_err(|e| FluxgateError::proxy(format!("bad host header: {}", e)))?,
        );
    }

    let proto = if ctx.client_scheme.is_empty() {
        "http"
    } else {
        ctx.client_scheme
    };
    req.headers_mut().insert(
        "x-forwarded-proto",
        proto
            .parse()
            .map_err(|e| FluxgateError::proxy(format!("bad proto header: {}", e)))?,
    );
    if let Some(ip) = ctx.client_ip {
        let forwarded_for = match req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip.to_string(),
        };
        if let Ok(value) = forwarded_for.parse() {
            req.headers_mut().insert("x-forwarded-for", value);
        }
    }

    let response_fut = client.request(req);
    let upstream = match header_timeout {
        Some(timeout) => tokio::time::timeout(timeout, response_fut)
            .await
            .map_err(|_| FluxgateError::timeout(timeout, "upstream response headers"))?,
        None => response_fut.await,
    }
    .map_err(FluxgateError::from)?;

    // Upstream 502/503/504 are transient for retry/failover purposes but
    // still forwarded verbatim when no retry wrapper intercepts them.
    Ok(build_downstream_response(upstream))
}

/// Copy the upstream response, dropping hop-by-hop headers.
pub fn build_downstream_response(upstream: Response<Body>) -> Response<Body> {
    let (parts, body) = upstream.into_parts();
    let mut builder = Response::builder().status(parts.status);

    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop_header(name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Whether an upstream response status classifies as a transient failure.
pub fn is_transient_status(status: hyper::StatusCode) -> bool {
    matches!(status.as_u16(), 502 | 503 | 504)
}

fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    // The Connection header may list additional hop-by-hop headers.
    let extra: Vec<String> = headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default();

    const HOP_HEADERS: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];
    for h in HOP_HEADERS {
        headers.remove(*h);
    }
    for name in extra {
        headers.remove(name.as_str());
    }
}

/// A request body read up to a cap.
pub enum BufferedBody {
    /// Fits within the cap; can be replayed any number of times.
    Replayable(Bytes),
    /// Exceeded the cap; the prefix plus the remaining stream is pumped
    /// back into a one-shot body.
    Streaming(Body),
}

impl BufferedBody {
    pub fn is_replayable(&self) -> bool {
        matches!(self, BufferedBody::Replayable(_))
    }

    /// Take a body for sending. Replayable bodies clone cheaply;
    /// a streaming body can only be taken once, so it is returned whole.
    pub fn to_body(&mut self) -> Body {
        match self {
            BufferedBody::Replayable(bytes) => Body::from(bytes.clone()),
            BufferedBody::Streaming(body) => std::mem::replace(body, Body::empty()),
        }
    }
}

/// Read a body up to `cap` bytes. Small bodies become replayable; larger
/// ones are stitched back together and remain one-shot.
pub async fn buffer_body(mut body: Body, cap: u64) -> FluxgateResult<BufferedBody> {
    let mut buffered: Vec<Bytes> = Vec::new();
    let mut total: u64 = 0;

    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(FluxgateError::from)?;
        total += chunk.len() as u64;
        buffered.push(chunk);

        if total > cap {
            // Over the cap: pump the prefix plus the remainder back out.
            let (mut tx, rebuilt) = Body::channel();
            tokio::spawn(async move {
                for chunk in buffered {
                    if tx.send_data(chunk).await.is_err() {
                        return;
                    }
                }
                while let Some(chunk) = body.data().await {
                    match chunk {
                        Ok(chunk) => {
                            if tx.send_data(chunk).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => {
                            tx.abort();
                            return;
                        }
                    }
                }
            });
            return Ok(BufferedBody::Streaming(rebuilt));
        }
    }

    let mut all = Vec::with_capacity(total as usize);
    for chunk in &buffered {
        all.extend_from_slice(chunk);
    }
    Ok(BufferedBody::Replayable(Bytes::from(all)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use std::convert::Infallible;

    async fn spawn_upstream() -> std::net::SocketAddr {
        let make_svc = make_service_fn(|_| async {
            Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
                let path = req.uri().path_and_query().unwrap().to_string();
                let host = req
                    .headers()
                    .get("host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let xff = req
                    .headers()
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                Ok::<_, Infallible>(
                    Response::builder()
                        .header("x-echo-path", path)
                        .header("x-echo-host", host)
                        .header("x-echo-xff", xff)
                        .body(Body::from("ok"))
                        .unwrap(),
                )
            }))
        });
        let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    fn test_client() -> HttpsClient {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        hyper::Client::builder().build::<_, Body>(https)
    }

    #[tokio::test]
    async fn test_forward_rewrites_uri_and_headers() {
        let addr = spawn_upstream().await;
        let client = test_client();

        let req = Request::builder()
            .uri("http://edge.test/api/users?page=2")
            .header("host", "edge.test")
            .header("connection", "x-dropme")
            .header("x-dropme", "1")
            .body(Body::empty())
            .unwrap();

        let ctx = ForwardContext {
            client_ip: Some("203.0.113.9".parse().unwrap()),
            client_scheme: "https",
        };
        let resp = forward(req, &format!("http://{}", addr), &client, None, &ctx, false)
            .await
            .unwrap();

        assert_eq!(resp.status(), hyper::StatusCode::OK);
        assert_eq!(
            resp.headers().get("x-echo-path").unwrap(),
            "/api/users?page=2"
        );
        assert_eq!(
            resp.headers().get("x-echo-host").unwrap().to_str().unwrap(),
            addr.to_string()
        );
        assert_eq!(resp.headers().get("x-echo-xff").unwrap(), "203.0.113.9");
    }

    #[tokio::test]
    async fn test_forward_pass_host_header() {
        let addr = spawn_upstream().await;
        let client = test_client();

        let req = Request::builder()
            .uri("http://edge.test/")
            .header("host", "edge.test")
            .body(Body::empty())
            .unwrap();

        let resp = forward(
            req,
            &format!("http://{}", addr),
            &client,
            None,
            &ForwardContext::default(),
            true,
        )
        .await
        .unwrap();

        assert_eq!(resp.headers().get("x-echo-host").unwrap(), "edge.test");
    }

    #[tokio::test]
    async fn test_forward_connect_error_is_transient() {
        let client = test_client();
        let req = Request::builder()
            .uri("http://edge.test/")
            .body(Body::empty())
            .unwrap();

        let err = forward(
            req,
            "http://127.0.0.1:1",
            &client,
            None,
            &ForwardContext::default(),
            false,
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_buffer_body_replayable() {
        let mut buffered = buffer_body(Body::from("hello"), 64).await.unwrap();
        assert!(buffered.is_replayable());

        let first = hyper::body::to_bytes(buffered.to_body()).await.unwrap();
        let second = hyper::body::to_bytes(buffered.to_body()).await.unwrap();
        assert_eq!(first, "hello");
        assert_eq!(second, "hello");
    }

    #[tokio::test]
    async fn test_buffer_body_over_cap_streams_once() {
        let payload = vec![7u8; 256];
        let mut buffered = buffer_body(Body::from(payload.clone()), 16).await.unwrap();
        assert!(!buffered.is_replayable());

        let out = hyper::body::to_bytes(buffered.to_body()).await.unwrap();
        assert_eq!(out.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(hyper::StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(hyper::StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(hyper::StatusCode::GATEWAY_TIMEOUT));
        assert!(!is_transient_status(hyper::StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_transient_status(hyper::StatusCode::NOT_FOUND));
    }
}
