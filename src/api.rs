//! Read-only JSON API (`api@internal`).
//!
//! Attachable to any HTTP router like a regular service. Serves the
//! current runtime configuration, including per-entity errors, so a
//! dashboard can show failing routers alongside healthy ones. The view
//! is swapped atomically with each installed generation.

use arc_swap::ArcSwap;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use crate::config::runtime::RuntimeConfig;
use crate::config::{EntryPointConfig, EntryPointProtocol};
use crate::error::FluxgateResult;

#[derive(Debug, Clone, Serialize)]
struct EntryPointView {
    name: String,
    address: String,
    protocol: &'static str,
}

/// The API's view of one installed generation.
pub struct ApiHandler {
    runtime: ArcSwap<RuntimeConfig>,
    entry_points: Vec<EntryPointView>,
}

impl ApiHandler {
    pub fn new(entry_points: &std::collections::HashMap<String, EntryPointConfig>) -> Self {
        let mut views: Vec<EntryPointView> = entry_points
            .iter()
            .map(|(name, ep)| EntryPointView {
                name: name.clone(),
                address: ep.address.to_string(),
                protocol: match ep.protocol {
                    EntryPointProtocol::Tcp => "tcp",
                    EntryPointProtocol::Udp => "udp",
                },
            })
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            runtime: ArcSwap::from_pointee(RuntimeConfig::default()),
            entry_points: views,
        }
    }

    /// Publish a freshly installed generation.
    pub fn update(&self, runtime: Arc<RuntimeConfig>) {
        self.runtime.store(runtime);
    }

    pub async fn handle(&self, req: Request<Body>) -> FluxgateResult<Response<Body>> {
        if req.method() != Method::GET {
            return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
        }

        let runtime = self.runtime.load();
        let body = match req.uri().path() {
            "/api/rawdata" => json_body(&**runtime),
            "/api/overview" => Ok(runtime.overview().to_string()),
            "/api/http/routers" => json_body(&runtime.routers),
            "/api/http/services" => json_body(&runtime.services),
            "/api/http/middlewares" => json_body(&runtime.middlewares),
            "/api/tcp/routers" => json_body(&runtime.tcp_routers),
            "/api/tcp/services" => json_body(&runtime.tcp_services),
            "/api/udp/routers" => json_body(&runtime.udp_routers),
            "/api/udp/services" => json_body(&runtime.udp_services),
            "/api/entrypoints" => json_body(&self.entry_points),
            _ => return Ok(status_response(StatusCode::NOT_FOUND)),
        };

        match body {
            Ok(body) => Ok(Response::builder()
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap_or_else(|_| Response::new(Body::empty()))),
            Err(e) => Err(e),
        }
    }
}

fn json_body<T: Serialize>(value: &T) -> FluxgateResult<String> {
    serde_json::to_string(value).map_err(crate::error::FluxgateError::from)
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DynamicConfig;
    use std::collections::HashMap;

    fn handler_with_state() -> ApiHandler {
        let mut entry_points = HashMap::new();
        entry_points.insert(
            "web".to_string(),
            EntryPointConfig {
                address: "127.0.0.1:80".parse().unwrap(),
                protocol: EntryPointProtocol::Tcp,
                h2c: false,
                forwarded_headers_trusted_ips: vec![],
                read_timeout: 0,
                idle_timeout: 180,
                graceful_timeout: 10,
                udp_session_timeout: 30,
            },
        );
        let handler = ApiHandler::new(&entry_points);

        let config: DynamicConfig = toml::from_str(
            r#"
[http.routers.site]
rule = 'Host(`a.test`)'
service = "backend"

[http.services.backend.load_balancer]
servers = [{ url = "http://127.0.0.1:3000" }]
"#,
        )
        .unwrap();
        let mut runtime = RuntimeConfig::new(&config);
        runtime.add_router_error("site", "service \"backend\" does not exist");
        runtime.populate_used_by();
        handler.update(Arc::new(runtime));
        handler
    }

    async fn get(handler: &ApiHandler, path: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("http://api.internal{}", path))
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle(req).await.unwrap();
        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_routers_carry_errors() {
        let handler = handler_with_state();
        let (status, routers) = get(&handler, "/api/http/routers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(routers["site"]["status"], "disabled");
        assert_eq!(
            routers["site"]["errors"][0],
            "service \"backend\" does not exist"
        );
    }

    #[tokio::test]
    async fn test_overview_and_entrypoints() {
        let handler = handler_with_state();

        let (_, overview) = get(&handler, "/api/overview").await;
        assert_eq!(overview["http"]["routers"]["total"], 1);
        assert_eq!(overview["http"]["routers"]["errors"], 1);

        let (_, entry_points) = get(&handler, "/api/entrypoints").await;
        assert_eq!(entry_points[0]["name"], "web");
        assert_eq!(entry_points[0]["protocol"], "tcp");
    }

    #[tokio::test]
    async fn test_rawdata_and_unknown_path() {
        let handler = handler_with_state();

        let (status, rawdata) = get(&handler, "/api/rawdata").await;
        assert_eq!(status, StatusCode::OK);
        assert!(rawdata["services"]["backend"]["used_by"][0] == "site");

        let (status, _) = get(&handler, "/api/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
