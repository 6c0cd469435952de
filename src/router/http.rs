//! HTTP router manager.
//!
//! For each TCP entry point and TLS-ness, the routers that target it are
//! compiled (cached rule AST + middleware chain + service handler) and
//! sorted by descending priority with ascending name as the tie-break.
//! Dispatch evaluates rules in that order against one request
//! projection; the first match wins and no match is a 404.

use hyper::{Body, Request, Response, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::config::dynamic::RouterConfig;
use crate::error::FluxgateResult;
use crate::middleware::{HttpHandler, MiddlewareBuilder};
use crate::router::rule::{cached_http_rule, Expr, HttpMatcher, RequestProjection};
use crate::service::forward::ForwardContext;
use crate::service::HttpServiceManager;

/// One compiled router ready for dispatch.
struct CompiledRouter {
    name: String,
    priority: i64,
    rule: Arc<Expr<HttpMatcher>>,
    handler: HttpHandler,
}

/// Ordered router set for one (entry point, TLS-ness).
#[derive(Default)]
pub struct EntryPointDispatcher {
    routers: Vec<CompiledRouter>,
}

impl EntryPointDispatcher {
    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    /// First-match dispatch; no match is a 404.
    pub fn into_handler(self) -> HttpHandler {
        let routers = Arc::new(self.routers);
        HttpHandler::new(move |req: Request<Body>, ctx: ForwardContext| {
            let routers = Arc::clone(&routers);
            let projection = RequestProjection::from_request(&req, ctx.client_ip);

            let matched = routers
                .iter()
                .find(|r| r.rule.matches(|m| m.matches(&projection)));

            match matched {
                Some(router) => {
                    debug!(router = %router.name, path = %projection.path, "Router matched");
                    crate::observe::router_request(&router.name);
                    router.handler.call(req, ctx)
                }
                None => Box::pin(async {
                    Ok(Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .body(Body::from("404 page not found"))
                        .expect("static response"))
                }),
            }
        })
    }
}

/// Builds the per-entry-point dispatchers for one generation.
pub struct HttpRouterManager<'a> {
    pub services: &'a HttpServiceManager,
    pub middlewares: &'a MiddlewareBuilder,
    pub entry_points: &'a [String],
}

impl<'a> HttpRouterManager<'a> {
    /// Build dispatchers for every entry point in `self.entry_points`,
    /// taking only routers whose TLS expectation matches `tls`.
    /// Reference failures are recorded per router and never fatal.
    pub fn build_dispatchers(
        &self,
        routers: &HashMap<String, RouterConfig>,
        tls: bool,
    ) -> (HashMap<String, EntryPointDispatcher>, BTreeMap<String, Vec<String>>) {
        let mut dispatchers: HashMap<String, EntryPointDispatcher> = self
            .entry_points
            .iter()
            .map(|ep| (ep.clone(), EntryPointDispatcher::default()))
            .collect();
        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (name, config) in routers {
            if config.tls.is_some() != tls {
                continue;
            }

            match self.compile(name, config) {
                Ok((compiled_eps, router)) => {
                    let router = Arc::new(router);
                    for ep in compiled_eps {
                        let dispatcher = dispatchers.entry(ep).or_default();
                        dispatcher.routers.push(CompiledRouter {
                            name: router.name.clone(),
                            priority: router.priority,
                            rule: Arc::clone(&router.rule),
                            handler: router.handler.clone(),
                        });
                    }
                }
                Err(e) => {
                    errors.entry(name.clone()).or_default().push(e.to_string());
                }
            }
        }

        for dispatcher in dispatchers.values_mut() {
            // Priority descending, name ascending for stable tie-breaks.
            dispatcher
                .routers
                .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));
        }

        (dispatchers, errors)
    }

    fn compile(
        &self,
        name: &str,
        config: &RouterConfig,
    ) -> FluxgateResult<(Vec<String>, CompiledRouter)> {
        // Invariant: every referenced entry point must exist; otherwise
        // the whole router is rejected, not silently narrowed.
        let entry_points = if config.entry_points.is_empty() {
            self.entry_points.to_vec()
        } else {
            for ep in &config.entry_points {
                if !self.entry_points.contains(ep) {
                    return Err(crate::error::FluxgateError::config(format!(
                        "entryPoint \"{}\" doesn't exist",
                        ep
                    )));
                }
            }
            config.entry_points.clone()
        };

        let rule = cached_http_rule(&config.rule)?;

        let service = self.services.get(&config.service).ok_or_else(|| {
            crate::error::FluxgateError::config(format!(
                "service \"{}\" does not exist",
                config.service
            ))
        })?;

        let handler = self
            .middlewares
            .build_chain(&config.middlewares, HttpHandler::from_service(service))?;

        Ok((
            entry_points,
            CompiledRouter {
                name: name.to_string(),
                priority: config.effective_priority(),
                rule,
                handler,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::health::HealthRegistry;
    use crate::service::loadbalancer::StickyRegistry;
    use crate::transport::DialerManager;

    struct Fixture {
        services: HttpServiceManager,
        middlewares: MiddlewareBuilder,
        entry_points: Vec<String>,
    }

    fn fixture(services_toml: &str, middlewares_toml: &str) -> Fixture {
        let configs = toml::from_str(services_toml).unwrap();
        let (services, _) = HttpServiceManager::build(
            &configs,
            &DialerManager::new(),
            &HealthRegistry::new(),
            &StickyRegistry::new(),
            None,
        );
        Fixture {
            services,
            middlewares: MiddlewareBuilder::new(toml::from_str(middlewares_toml).unwrap()),
            entry_points: vec!["web".to_string(), "websecure".to_string()],
        }
    }

    fn routers(toml_str: &str) -> HashMap<String, RouterConfig> {
        toml::from_str(toml_str).unwrap()
    }

    const BACKEND: &str = r#"
[backend.load_balancer]
servers = [{ url = "http://127.0.0.1:3000" }]
"#;

    #[test]
    fn test_routers_partition_by_tls() {
        let f = fixture(BACKEND, "");
        let manager = HttpRouterManager {
            services: &f.services,
            middlewares: &f.middlewares,
            entry_points: &f.entry_points,
        };

        let router_configs = routers(
            r#"
[plain]
entry_points = ["web"]
rule = 'Host(`a.test`)'
service = "backend"

[secure]
entry_points = ["websecure"]
rule = 'Host(`a.test`)'
service = "backend"
[secure.tls]
"#,
        );

        let (plain, errors) = manager.build_dispatchers(&router_configs, false);
        assert!(errors.is_empty());
        assert_eq!(plain["web"].len(), 1);
        assert_eq!(plain["websecure"].len(), 0);

        let (tls, errors) = manager.build_dispatchers(&router_configs, true);
        assert!(errors.is_empty());
        assert_eq!(tls["websecure"].len(), 1);
        assert_eq!(tls["web"].len(), 0);
    }

    #[test]
    fn test_unknown_entry_point_rejects_router() {
        let f = fixture(BACKEND, "");
        let manager = HttpRouterManager {
            services: &f.services,
            middlewares: &f.middlewares,
            entry_points: &f.entry_points,
        };

        let router_configs = routers(
            r#"
[bad]
entry_points = ["webz"]
rule = 'Host(`a.test`)'
service = "backend"
"#,
        );

        let (dispatchers, errors) = manager.build_dispatchers(&router_configs, false);
        assert_eq!(dispatchers["web"].len(), 0);
        assert!(errors["bad"][0].contains("webz"));
    }

    #[test]
    fn test_bad_rule_and_bad_service_error_the_router() {
        let f = fixture(BACKEND, "");
        let manager = HttpRouterManager {
            services: &f.services,
            middlewares: &f.middlewares,
            entry_points: &f.entry_points,
        };

        let router_configs = routers(
            r#"
[badrule]
rule = 'Host(`a.test`) &&'
service = "backend"

[badsvc]
rule = 'Host(`a.test`)'
service = "ghost"

[badmw]
rule = 'Host(`a.test`)'
middlewares = ["nope"]
service = "backend"

[good]
rule = 'Host(`a.test`)'
service = "backend"
"#,
        );

        let (dispatchers, errors) = manager.build_dispatchers(&router_configs, false);
        // The sibling keeps serving.
        assert_eq!(dispatchers["web"].len(), 1);
        assert!(errors.contains_key("badrule"));
        assert!(errors["badsvc"][0].contains("ghost"));
        assert!(errors["badmw"][0].contains("nope"));
    }

    async fn dispatch(
        dispatchers: HashMap<String, EntryPointDispatcher>,
        ep: &str,
        host: &str,
        path: &str,
    ) -> Response<Body> {
        let handler = dispatchers
            .into_iter()
            .find(|(name, _)| name == ep)
            .unwrap()
            .1
            .into_handler();
        let req = Request::builder()
            .uri(format!("http://{}{}", host, path))
            .header("host", host)
            .body(Body::empty())
            .unwrap();
        handler.call(req, ForwardContext::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_no_match_is_404() {
        let f = fixture(BACKEND, "");
        let manager = HttpRouterManager {
            services: &f.services,
            middlewares: &f.middlewares,
            entry_points: &f.entry_points,
        };

        let router_configs = routers(
            r#"
[only]
rule = 'Host(`a.test`)'
service = "backend"
"#,
        );

        let (dispatchers, _) = manager.build_dispatchers(&router_configs, false);
        let resp = dispatch(dispatchers, "web", "other.test", "/").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_priority_order_and_name_tiebreak() {
        // Two fixed-status services so the winning router is observable.
        let f = fixture(
            r#"
[alpha.load_balancer]
servers = [{ url = "http://127.0.0.1:3000" }]

[beta.load_balancer]
servers = [{ url = "http://127.0.0.1:3001" }]
"#,
            "",
        );

        // Hand-compile two routers with equal priority but different
        // names to check the lexicographic tie-break, plus one with
        // higher priority that must win outright.
        let mut dispatcher = EntryPointDispatcher::default();
        let mark = |status: StatusCode| {
            HttpHandler::new(move |_req, _ctx| {
                Box::pin(async move {
                    Ok(Response::builder()
                        .status(status)
                        .body(Body::empty())
                        .unwrap())
                })
            })
        };

        dispatcher.routers.push(CompiledRouter {
            name: "zeta".to_string(),
            priority: 5,
            rule: cached_http_rule("PathPrefix(`/`)").unwrap(),
            handler: mark(StatusCode::GONE),
        });
        dispatcher.routers.push(CompiledRouter {
            name: "alpha".to_string(),
            priority: 5,
            rule: cached_http_rule("PathPrefix(`/`)").unwrap(),
            handler: mark(StatusCode::ACCEPTED),
        });
        dispatcher.routers.push(CompiledRouter {
            name: "priority-winner".to_string(),
            priority: 10,
            rule: cached_http_rule("Path(`/x`)").unwrap(),
            handler: mark(StatusCode::CREATED),
        });
        dispatcher
            .routers
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));

        let handler = dispatcher.into_handler();

        // Priority 10 wins on /x even though the catch-alls also match.
        let req = Request::builder()
            .uri("http://a.test/x")
            .body(Body::empty())
            .unwrap();
        let resp = handler.call(req, ForwardContext::default()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        // Equal priority: the lexicographically smaller name wins.
        let req = Request::builder()
            .uri("http://a.test/y")
            .body(Body::empty())
            .unwrap();
        let resp = handler.call(req, ForwardContext::default()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let _ = &f;
    }

    #[test]
    fn test_default_priority_is_rule_length() {
        let config: RouterConfig = toml::from_str(
            r#"
rule = 'Host(`a.test`) && Path(`/x`)'
service = "s"
"#,
        )
        .unwrap();
        assert_eq!(config.effective_priority(), config.rule.len() as i64);
    }
}
