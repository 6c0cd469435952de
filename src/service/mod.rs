//! Service plane: builds forwarding handlers from service definitions.
//!
//! A service definition is one of `load_balancer`, `weighted`,
//! `mirroring` or `failover`; the latter three compose other services by
//! name, so building is a recursive resolution with cycle detection.
//! Load balancers own the long-lived sub-state (health cells, sticky
//! secrets, round-robin counters); that state lives in process-wide
//! registries so it survives generations with unchanged identity.

pub mod forward;
pub mod health;
pub mod loadbalancer;
pub mod tcp;
pub mod udp;

use hyper::{Body, Request, Response};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::ApiHandler;
use crate::config::dynamic::{MirroringConfig, ServiceConfig, WeightedConfig};
use crate::error::{FluxgateError, FluxgateResult};
use crate::service::forward::{buffer_body, ForwardContext};
use crate::service::health::{HealthChecker, HealthRegistry, ServerCell};
use crate::service::loadbalancer::{service_identity, LoadBalancerService, Server, StickyRegistry};
use crate::transport::{DialerManager, DEFAULT_TRANSPORT};

/// Reserved name of the internal API service.
pub const API_SERVICE: &str = "api@internal";

/// Body cap for failover replays; larger bodies are not retried.
const FAILOVER_BODY_CAP: u64 = 64 * 1024;

/// A materialised HTTP service handler.
pub enum HttpService {
    LoadBalancer(LoadBalancerService),
    Weighted {
        name: String,
        children: Vec<(Arc<HttpService>, u32)>,
        total_weight: u32,
    },
    Mirroring {
        name: String,
        primary: Arc<HttpService>,
        mirrors: Vec<(Arc<HttpService>, u8)>,
        body_cap: u64,
    },
    Failover {
        name: String,
        primary: Arc<HttpService>,
        fallback: Arc<HttpService>,
    },
    /// Read-only JSON view of the runtime configuration
    Internal(Arc<ApiHandler>),
}

impl HttpService {
    pub fn name(&self) -> &str {
        match self {
            HttpService::LoadBalancer(lb) => lb.name(),
            HttpService::Weighted { name, .. } => name,
            HttpService::Mirroring { name, .. } => name,
            HttpService::Failover { name, .. } => name,
            HttpService::Internal(_) => API_SERVICE,
        }
    }

    /// Handle one request. Boxed because composite services recurse.
    pub fn handle(
        self: Arc<Self>,
        req: Request<Body>,
        ctx: ForwardContext,
    ) -> Pin<Box<dyn Future<Output = FluxgateResult<Response<Body>>> + Send>> {
        Box::pin(async move {
            match &*self {
                HttpService::LoadBalancer(lb) => {
                    let response = lb.handle(req, &ctx).await;
                    if let Ok(response) = &response {
                        crate::observe::service_request(lb.name(), response.status());
                    }
                    response
                }
                HttpService::Weighted {
                    children,
                    total_weight,
                    name,
                } => {
                    let Some((first, _)) = children.first() else {
                        return Err(FluxgateError::service_unavailable(format!(
                            "weighted service '{}' has no children",
                            name
                        )));
                    };
                    // Selection is per request and stateless.
                    let mut roll = rand::thread_rng().gen_range(0..*total_weight);
                    for (child, weight) in children {
                        if roll < *weight {
                            return Arc::clone(child).handle(req, ctx).await;
                        }
                        roll -= weight;
                    }
                    Arc::clone(first).handle(req, ctx).await
                }
                HttpService::Mirroring {
                    primary,
                    mirrors,
                    body_cap,
                    name,
                } => {
                    let (parts, body) = req.into_parts();
                    let mut buffered = buffer_body(body, *body_cap).await?;

                    if buffered.is_replayable() {
                        for (mirror, percent) in mirrors {
                            if *percent < 100
                                && rand::thread_rng().gen_range(0..100u8) >= *percent
                            {
                                continue;
                            }
                            let mut mirror_req = Request::builder()
                                .method(parts.method.clone())
                                .uri(parts.uri.clone());
                            if let Some(headers) = mirror_req.headers_mut() {
                                headers.extend(parts.headers.clone());
                            }
                            let Ok(mirror_req) = mirror_req.body(buffered.to_body()) else {
                                continue;
                            };

                            // Fire and forget: mirror responses are
                            // discarded, mirror failures only logged.
                            let mirror = Arc::clone(mirror);
                            let mirror_ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = mirror.handle(mirror_req, mirror_ctx).await {
                                    debug!(error = %e, "Mirror request failed");
                                }
                            });
                        }
                    } else {
                        debug!(
                            service = %name,
                            cap = body_cap,
                            "Body exceeds mirror cap, skipping mirrors"
                        );
                    }

                    let primary_req = Request::from_parts(parts, buffered.to_body());
                    Arc::clone(primary).handle(primary_req, ctx).await
                }
                HttpService::Failover {
                    primary,
                    fallback,
                    name,
                } => {
                    let (parts, body) = req.into_parts();
                    let mut buffered = buffer_body(body, FAILOVER_BODY_CAP).await?;
                    let replayable = buffered.is_replayable();

                    let mut primary_req = Request::builder()
                        .method(parts.method.clone())
                        .uri(parts.uri.clone());
                    if let Some(headers) = primary_req.headers_mut() {
                        headers.extend(parts.headers.clone());
                    }
                    let primary_req = primary_req
                        .body(buffered.to_body())
                        .map_err(FluxgateError::from)?;

                    let failed = match Arc::clone(primary).handle(primary_req, ctx.clone()).await
                    {
                        Ok(response) if !forward::is_transient_status(response.status()) => {
                            return Ok(response)
                        }
                        Ok(response) => {
                            debug!(
                                service = %name,
                                status = %response.status(),
                                "Primary answered with a transient status"
                            );
                            Ok(response)
                        }
                        Err(e) if e.is_transient() => Err(e),
                        Err(e) => return Err(e),
                    };

                    if !replayable {
                        // The body is gone; surface the primary outcome.
                        return failed;
                    }

                    warn!(service = %name, "Failing over to fallback service");
                    let fallback_req = Request::from_parts(parts, buffered.to_body());
                    Arc::clone(fallback).handle(fallback_req, ctx).await
                }
                HttpService::Internal(api) => api.handle(req).await,
            }
        })
    }
}

/// Per-generation table of HTTP services plus the health probes to
/// launch for it.
pub struct HttpServiceManager {
    services: HashMap<String, Arc<HttpService>>,
    checkers: Vec<HealthChecker>,
}

impl HttpServiceManager {
    /// Build every service in the snapshot. Failing services are left
    /// out of the table and their errors returned for the runtime
    /// config; referencing routers get errored during router build.
    pub fn build(
        configs: &HashMap<String, ServiceConfig>,
        dialers: &DialerManager,
        health_registry: &HealthRegistry,
        sticky_registry: &StickyRegistry,
        api: Option<Arc<ApiHandler>>,
    ) -> (Self, BTreeMap<String, Vec<String>>) {
        let mut builder = ServiceBuilder {
            configs,
            dialers,
            health_registry,
            sticky_registry,
            built: HashMap::new(),
            checkers: Vec::new(),
            errors: BTreeMap::new(),
            stack: Vec::new(),
        };

        for name in configs.keys() {
            builder.resolve(name);
        }

        let mut services = builder.built;
        if let Some(api) = api {
            services.insert(
                API_SERVICE.to_string(),
                Arc::new(HttpService::Internal(api)),
            );
        }

        // Registries only keep state for services that still exist.
        let live: Vec<String> = services.keys().cloned().collect();
        health_registry.retain(&live);
        sticky_registry.retain(&live);

        (
            Self {
                services,
                checkers: builder.checkers,
            },
            builder.errors,
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<HttpService>> {
        self.services.get(name).cloned()
    }

    /// Spawn this generation's health probe loops. They stop when the
    /// generation's shutdown signal fires.
    pub fn launch_health_checks(&mut self, shutdown: tokio::sync::watch::Receiver<bool>) {
        for checker in self.checkers.drain(..) {
            let shutdown = shutdown.clone();
            tokio::spawn(checker.run(shutdown));
        }
    }
}

struct ServiceBuilder<'a> {
    configs: &'a HashMap<String, ServiceConfig>,
    dialers: &'a DialerManager,
    health_registry: &'a HealthRegistry,
    sticky_registry: &'a StickyRegistry,
    built: HashMap<String, Arc<HttpService>>,
    checkers: Vec<HealthChecker>,
    errors: BTreeMap<String, Vec<String>>,
    stack: Vec<String>,
}

impl<'a> ServiceBuilder<'a> {
    fn fail(&mut self, name: &str, message: String) -> Option<Arc<HttpService>> {
        warn!(service = %name, error = %message, "Service disabled");
        self.errors.entry(name.to_string()).or_default().push(message);
        None
    }

    fn resolve(&mut self, name: &str) -> Option<Arc<HttpService>> {
        if let Some(service) = self.built.get(name) {
            return Some(Arc::clone(service));
        }
        if self.errors.contains_key(name) {
            return None;
        }
        if self.stack.iter().any(|n| n == name) {
            let cycle = format!(
                "service cycle: {} -> {}",
                self.stack.join(" -> "),
                name
            );
            return self.fail(name, cycle);
        }

        let Some(config) = self.configs.get(name) else {
            return self.fail(name, format!("service \"{}\" does not exist", name));
        };

        self.stack.push(name.to_string());
        let service = self.build_one(name, config);
        self.stack.pop();

        if let Some(service) = &service {
            self.built.insert(name.to_string(), Arc::clone(service));
        }
        service
    }

    fn build_one(&mut self, name: &str, config: &ServiceConfig) -> Option<Arc<HttpService>> {
        match config {
            ServiceConfig::LoadBalancer(lb_config) => {
                if lb_config.servers.is_empty() {
                    return self.fail(name, "load balancer has no servers".to_string());
                }

                let transport = lb_config
                    .transport
                    .as_deref()
                    .unwrap_or(DEFAULT_TRANSPORT);
                let client = match self.dialers.http_client(transport) {
                    Ok(client) => client,
                    Err(e) => return self.fail(name, e.to_string()),
                };
                let header_timeout = self.dialers.response_header_timeout(transport);

                let urls: Vec<String> =
                    lb_config.servers.iter().map(|s| s.url.clone()).collect();

                // Health cells live in the registry only for probed
                // services; an unprobed service gets fresh local cells
                // so stale verdicts cannot leak across reloads.
                let cells: Vec<Arc<ServerCell>> = if lb_config.health_check.is_some() {
                    self.health_registry.attach(name, &urls)
                } else {
                    urls.iter().map(|_| Arc::new(ServerCell::default())).collect()
                };

                if let Some(health_config) = &lb_config.health_check {
                    self.checkers.push(HealthChecker::new(
                        name.to_string(),
                        health_config.clone(),
                        urls.iter().cloned().zip(cells.iter().cloned()).collect(),
                    ));
                }

                let sticky = lb_config.sticky.clone().map(|sticky_config| {
                    let identity = service_identity(name, &urls, &lb_config.sticky);
                    let secret = self.sticky_registry.attach(name, identity);
                    (sticky_config, secret)
                });

                let servers = lb_config
                    .servers
                    .iter()
                    .zip(cells)
                    .map(|(server, cell)| Server {
                        url: server.url.trim_end_matches('/').to_string(),
                        weight: server.effective_weight(),
                        cell,
                    })
                    .collect();

                Some(Arc::new(HttpService::LoadBalancer(
                    LoadBalancerService::new(
                        name.to_string(),
                        servers,
                        sticky,
                        lb_config.pass_host_header,
                        client,
                        header_timeout,
                    ),
                )))
            }
            ServiceConfig::Weighted(WeightedConfig { services }) => {
                if services.is_empty() {
                    return self.fail(name, "weighted service has no children".to_string());
                }
                let mut children = Vec::new();
                for child_ref in services {
                    match self.resolve(&child_ref.name) {
                        Some(child) => children.push((child, child_ref.effective_weight())),
                        None => {
                            return self.fail(
                                name,
                                format!("service \"{}\" does not exist", child_ref.name),
                            )
                        }
                    }
                }
                let total_weight = children.iter().map(|(_, w)| w).sum();
                Some(Arc::new(HttpService::Weighted {
                    name: name.to_string(),
                    children,
                    total_weight,
                }))
            }
            ServiceConfig::Mirroring(MirroringConfig {
                service,
                mirrors,
                max_body_size,
            }) => {
                let primary = match self.resolve(service) {
                    Some(primary) => primary,
                    None => {
                        return self
                            .fail(name, format!("service \"{}\" does not exist", service))
                    }
                };
                let mut mirror_services = Vec::new();
                for mirror in mirrors {
                    match self.resolve(&mirror.name) {
                        Some(m) => {
                            mirror_services.push((m, mirror.percent.unwrap_or(100).min(100)))
                        }
                        None => {
                            return self.fail(
                                name,
                                format!("service \"{}\" does not exist", mirror.name),
                            )
                        }
                    }
                }
                Some(Arc::new(HttpService::Mirroring {
                    name: name.to_string(),
                    primary,
                    mirrors: mirror_services,
                    body_cap: *max_body_size,
                }))
            }
            ServiceConfig::Failover(failover) => {
                let primary = match self.resolve(&failover.service) {
                    Some(primary) => primary,
                    None => {
                        return self.fail(
                            name,
                            format!("service \"{}\" does not exist", failover.service),
                        )
                    }
                };
                let fallback = match self.resolve(&failover.fallback) {
                    Some(fallback) => fallback,
                    None => {
                        return self.fail(
                            name,
                            format!("service \"{}\" does not exist", failover.fallback),
                        )
                    }
                };
                Some(Arc::new(HttpService::Failover {
                    name: name.to_string(),
                    primary,
                    fallback,
                }))
            }
        }
    }
}
