//! Entry-point middleware chain.
//!
//! Cross-cutting wrappers prepended to every router chain on an entry
//! point, outermost first: capture, access log, tracing span, entry-point
//! metrics. Each wrapper installs only when its subsystem is configured,
//! and installation is idempotent across reloads because every
//! generation builds its chain from scratch. The capture wrapper also
//! converts data-path errors into responses, so the observers downstream
//! of it always see a final status, whatever the inner handlers did.

use hyper::{Body, Response, StatusCode};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

use crate::access_log::AccessLogger;
use crate::error::FluxgateError;
use crate::middleware::HttpHandler;

/// Builds the per-entry-point cross-cutting chain.
pub struct ChainBuilder {
    access_logger: Option<Arc<AccessLogger>>,
    entry_point_metrics: bool,
}

impl ChainBuilder {
    pub fn new(access_logger: Option<Arc<AccessLogger>>, entry_point_metrics: bool) -> Self {
        Self {
            access_logger,
            entry_point_metrics,
        }
    }

    /// Wrap `inner` with the configured observers for `entry_point`.
    pub fn wrap(&self, entry_point: &str, inner: HttpHandler) -> HttpHandler {
        let mut handler = inner;

        if self.entry_point_metrics {
            handler = wrap_metrics(entry_point.to_string(), handler);
        }

        handler = wrap_tracing(entry_point.to_string(), handler);

        if let Some(logger) = &self.access_logger {
            handler = wrap_access_log(entry_point.to_string(), Arc::clone(logger), handler);
        }

        // Capture runs outermost iff anything below observes responses.
        if self.access_logger.is_some() || self.entry_point_metrics {
            handler = wrap_capture(handler);
        }

        handler
    }
}

/// Convert data-path errors into responses so every observer below sees
/// a final status. Errors never cross the entry-point boundary.
fn wrap_capture(next: HttpHandler) -> HttpHandler {
    HttpHandler::new(move |req, ctx| {
        let next = next.clone();
        Box::pin(async move {
            match next.call(req, ctx).await {
                Ok(response) => Ok(response),
                Err(e) => Ok(error_response(&e)),
            }
        })
    })
}

/// Map an error to the response the client sees.
pub fn error_response(err: &FluxgateError) -> Response<Body> {
    let status = match err {
        FluxgateError::Client { .. } => StatusCode::BAD_REQUEST,
        FluxgateError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        FluxgateError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        FluxgateError::Network { .. }
        | FluxgateError::ServiceUnavailable { .. }
        | FluxgateError::Tls { .. }
        | FluxgateError::Proxy { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn wrap_access_log(
    entry_point: String,
    logger: Arc<AccessLogger>,
    next: HttpHandler,
) -> HttpHandler {
    HttpHandler::new(move |req, ctx| {
        let next = next.clone();
        let logger = Arc::clone(&logger);
        let entry_point = entry_point.clone();

        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        Box::pin(async move {
            let start = Instant::now();
            let result = next.call(req, ctx.clone()).await;
            let status = match &result {
                Ok(response) => response.status(),
                Err(e) => error_response(e).status(),
            };
            logger
                .log(
                    &entry_point,
                    &method,
                    &host,
                    &uri,
                    status.as_u16(),
                    ctx.client_ip,
                    start.elapsed(),
                )
                .await;
            result
        })
    })
}

fn wrap_tracing(entry_point: String, next: HttpHandler) -> HttpHandler {
    HttpHandler::new(move |req, ctx| {
        let span = tracing::info_span!(
            "entry_point",
            name = %entry_point,
            method = %req.method(),
            path = %req.uri().path()
        );
        Box::pin(next.call(req, ctx).instrument(span))
    })
}

fn wrap_metrics(entry_point: String, next: HttpHandler) -> HttpHandler {
    HttpHandler::new(move |req, ctx| {
        let next = next.clone();
        let entry_point = entry_point.clone();
        let method = req.method().to_string();
        let protocol = format!("{:?}", req.version());
        let request_bytes = content_length(req.headers());

        Box::pin(async move {
            let start = Instant::now();
            let result = next.call(req, ctx).await;
            let (status, response_bytes) = match &result {
                Ok(response) => (response.status(), content_length(response.headers())),
                Err(e) => (error_response(e).status(), 0),
            };
            crate::observe::entry_point_request(
                &entry_point,
                &method,
                &protocol,
                status.as_u16(),
                start.elapsed(),
            );
            crate::observe::entry_point_bytes(&entry_point, request_bytes, response_bytes);
            result
        })
    })
}

fn content_length(headers: &hyper::HeaderMap) -> u64 {
    headers
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
