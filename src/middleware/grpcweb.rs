//! gRPC-web to gRPC translation.
//!
//! Browsers cannot speak native gRPC (no trailer support), so gRPC-web
//! clients send `application/grpc-web*` bodies over plain HTTP and
//! expect the trailers encoded as a final body frame. This middleware
//! rewrites the request into native gRPC for the upstream, then folds
//! the upstream's trailers into a trailer frame (flag `0x80`) on the way
//! back. CORS is enforced against the configured origin list; `*`
//! allows any origin.

use hyper::body::{Bytes, HttpBody as _};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Body, Request, Response, StatusCode};

use crate::config::dynamic::GrpcWebConfig;
use crate::error::FluxgateError;
use crate::middleware::HttpHandler;

const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web";
const TRAILER_FRAME_FLAG: u8 = 0x80;

pub fn build(config: GrpcWebConfig, next: HttpHandler) -> HttpHandler {
    HttpHandler::new(move |req, ctx| {
        let next = next.clone();
        let config = config.clone();
        Box::pin(async move {
            let origin = req
                .headers()
                .get(hyper::header::ORIGIN)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            // CORS preflight for a gRPC-web call.
            if req.method() == hyper::Method::OPTIONS
                && req
                    .headers()
                    .contains_key(hyper::header::ACCESS_CONTROL_REQUEST_METHOD)
            {
                return Ok(preflight_response(&config, origin.as_deref()));
            }

            let is_grpc_web = req
                .headers()
                .get(hyper::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with(GRPC_WEB_CONTENT_TYPE));

            if !is_grpc_web {
                return next.call(req, ctx).await;
            }

            if let Some(origin) = &origin {
                if !origin_allowed(&config, origin) {
                    return Ok(Response::builder()
                        .status(StatusCode::FORBIDDEN)
                        .body(Body::empty())
                        .expect("static response"));
                }
            }

            // Upgrade the request to native gRPC. The message framing is
            // identical, only the content type and trailer expectations
            // change.
            let (mut parts, body) = req.into_parts();
            let upstream_content_type = parts
                .headers
                .get(hyper::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.replacen(GRPC_WEB_CONTENT_TYPE, "application/grpc", 1))
                .unwrap_or_else(|| "application/grpc".to_string());
            parts.headers.insert(
                hyper::header::CONTENT_TYPE,
                upstream_content_type
                    .parse()
                    .unwrap_or_else(|_| HeaderValue::from_static("application/grpc")),
            );
            parts.headers.insert("te", HeaderValue::from_static("trailers"));
            parts.headers.remove(hyper::header::CONTENT_LENGTH);

            let response = next.call(Request::from_parts(parts, body), ctx).await?;
            let (mut resp_parts, mut resp_body) = response.into_parts();

            // Drain the data frames, then collect the trailers.
            let mut data = Vec::new();
            while let Some(chunk) = resp_body.data().await {
                let chunk = chunk.map_err(FluxgateError::from)?;
                data.extend_from_slice(&chunk);
            }
            let trailers = resp_body
                .trailers()
                .await
                .map_err(FluxgateError::from)?
                .unwrap_or_default();

            let trailer_frame = encode_trailer_frame(&resp_parts.headers, &trailers);
            data.extend_from_slice(&trailer_frame);

            resp_parts.headers.insert(
                hyper::header::CONTENT_TYPE,
                HeaderValue::from_static("application/grpc-web+proto"),
            );
            resp_parts.headers.remove(hyper::header::CONTENT_LENGTH);
            resp_parts.headers.insert(
                hyper::header::ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static("grpc-status, grpc-message"),
            );
            if let Some(origin) = origin {
                if let Ok(value) = origin.parse() {
                    resp_parts
                        .headers
                        .insert(hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
                }
            }

            Ok(Response::from_parts(resp_parts, Body::from(Bytes::from(data))))
        })
    })
}

fn origin_allowed(config: &GrpcWebConfig, origin: &str) -> bool {
    config
        .allow_origins
        .iter()
        .any(|allowed| allowed == "*" || allowed == origin)
}

fn preflight_response(config: &GrpcWebConfig, origin: Option<&str>) -> Response<Body> {
    let mut builder = Response::builder().status(StatusCode::NO_CONTENT);

    if let Some(origin) = origin {
        if origin_allowed(config, origin) {
            builder = builder
                .header(hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN, origin)
                .header(
                    hyper::header::ACCESS_CONTROL_ALLOW_METHODS,
                    "POST, OPTIONS",
                )
                .header(
                    hyper::header::ACCESS_CONTROL_ALLOW_HEADERS,
                    "content-type, x-grpc-web, x-user-agent, grpc-timeout",
                )
                .header(hyper::header::ACCESS_CONTROL_MAX_AGE, "600");
        }
    }

    builder
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Encode gRPC trailers as a gRPC-web trailer frame. A trailers-only
/// response carries `grpc-status` in the headers instead, so those are
/// consulted as the fallback.
fn encode_trailer_frame(headers: &HeaderMap, trailers: &HeaderMap) -> Vec<u8> {
    let mut payload = String::new();

    let mut wrote_status = false;
    for (name, value) in trailers {
        if let Ok(value) = value.to_str() {
            payload.push_str(&format!("{}: {}\r\n", name.as_str().to_lowercase(), value));
            if name.as_str().eq_ignore_ascii_case("grpc-status") {
                wrote_status = true;
            }
        }
    }

    if !wrote_status {
        let status = headers
            .get("grpc-status")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("0");
        payload.push_str(&format!("grpc-status: {}\r\n", status));
        if let Some(message) = headers.get("grpc-message").and_then(|v| v.to_str().ok()) {
            payload.push_str(&format!("grpc-message: {}\r\n", message));
        }
    }

    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(TRAILER_FRAME_FLAG);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload.as_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::forward::ForwardContext;

    fn grpc_upstream() -> HttpHandler {
        HttpHandler::new(|req, _ctx| {
            Box::pin(async move {
                // Assert the request was upgraded to native gRPC.
                assert_eq!(
                    req.headers()[hyper::header::CONTENT_TYPE],
                    "application/grpc+proto"
                );
                assert_eq!(req.headers()["te"], "trailers");

                let (mut tx, body) = Body::channel();
                tokio::spawn(async move {
                    // One length-prefixed gRPC message frame.
                    let message = [0u8, 0, 0, 0, 3, 1, 2, 3];
                    let _ = tx.send_data(Bytes::copy_from_slice(&message)).await;
                    let mut trailers = HeaderMap::new();
                    trailers.insert("grpc-status", "0".parse().unwrap());
                    trailers.insert("grpc-message", "ok".parse().unwrap());
                    let _ = tx.send_trailers(trailers).await;
                });

                Ok(Response::builder()
                    .header(hyper::header::CONTENT_TYPE, "application/grpc+proto")
                    .body(body)
                    .unwrap())
            })
        })
    }

    fn grpc_web_request() -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("http://a.test/pkg.Service/Method")
            .header(hyper::header::CONTENT_TYPE, "application/grpc-web+proto")
            .header(hyper::header::ORIGIN, "https://app.test")
            .body(Body::from(vec![0u8, 0, 0, 0, 1, 9]))
            .unwrap()
    }

    #[tokio::test]
    async fn test_translation_and_cors() {
        let handler = build(
            GrpcWebConfig {
                allow_origins: vec!["*".to_string()],
            },
            grpc_upstream(),
        );

        let resp = handler
            .call(grpc_web_request(), ForwardContext::default())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[hyper::header::CONTENT_TYPE],
            "application/grpc-web+proto"
        );
        assert_eq!(
            resp.headers()[hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.test"
        );

        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        // Data frame passes through untouched.
        assert_eq!(&body[..8], &[0, 0, 0, 0, 3, 1, 2, 3]);
        // Trailer frame follows: flag 0x80, u32 length, then the text.
        assert_eq!(body[8], TRAILER_FRAME_FLAG);
        let trailer_len =
            u32::from_be_bytes([body[9], body[10], body[11], body[12]]) as usize;
        let trailer_text = std::str::from_utf8(&body[13..13 + trailer_len]).unwrap();
        assert!(trailer_text.contains("grpc-status: 0"));
        assert!(trailer_text.contains("grpc-message: ok"));
    }

    #[tokio::test]
    async fn test_origin_rejected() {
        let handler = build(
            GrpcWebConfig {
                allow_origins: vec!["https://trusted.test".to_string()],
            },
            grpc_upstream(),
        );

        let resp = handler
            .call(grpc_web_request(), ForwardContext::default())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_preflight() {
        let handler = build(
            GrpcWebConfig {
                allow_origins: vec!["*".to_string()],
            },
            grpc_upstream(),
        );

        let req = Request::builder()
            .method("OPTIONS")
            .uri("http://a.test/pkg.Service/Method")
            .header(hyper::header::ORIGIN, "https://app.test")
            .header(hyper::header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();

        let resp = handler.call(req, ForwardContext::default()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers()[hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.test"
        );
        assert!(resp
            .headers()
            .contains_key(hyper::header::ACCESS_CONTROL_ALLOW_METHODS));
    }

    #[tokio::test]
    async fn test_non_grpc_web_passes_through() {
        let handler = build(
            GrpcWebConfig {
                allow_origins: vec![],
            },
            HttpHandler::new(|_req, _ctx| {
                Box::pin(async { Ok(Response::new(Body::from("plain"))) })
            }),
        );

        let req = Request::builder()
            .uri("http://a.test/")
            .body(Body::empty())
            .unwrap();
        let resp = handler.call(req, ForwardContext::default()).await.unwrap();
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(body, "plain");
    }
}
