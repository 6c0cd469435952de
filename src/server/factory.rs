//! Router factory: turns one configuration snapshot into a generation.
//!
//! Build order follows the dependency chain: transports and TLS stores
//! first, then HTTP services (health checks launch under the new
//! generation's cancellation), middlewares, the HTTP dispatchers per
//! entry point and TLS-ness, the TCP plane, and finally UDP. Every
//! failing reference is recorded on its owning entity in the runtime
//! config; nothing short of a poisoned process state fails the build.
//! Creating a new generation cancels the previous one's children.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::ApiHandler;
use crate::config::runtime::RuntimeConfig;
use crate::config::{DynamicConfig, StaticConfig};
use crate::middleware::chain::ChainBuilder;
use crate::middleware::{HttpHandler, MiddlewareBuilder};
use crate::router::http::HttpRouterManager;
use crate::router::tcp::{EntryPointHttpConfig, TcpRouterManager, TcpRouterRoot};
use crate::router::udp::UdpRouterManager;
use crate::service::health::HealthRegistry;
use crate::service::loadbalancer::StickyRegistry;
use crate::service::tcp::TcpServiceManager;
use crate::service::udp::{UdpService, UdpServiceManager};
use crate::service::HttpServiceManager;
use crate::tls::TlsManager;
use crate::transport::DialerManager;

/// One fully built runtime tree plus its lifetime signal.
pub struct Generation {
    pub tcp_roots: HashMap<String, Arc<TcpRouterRoot>>,
    pub udp_handlers: HashMap<String, Arc<UdpService>>,
    pub runtime: Arc<RuntimeConfig>,
    /// Valid router count per TCP entry point, for the keep-previous rule
    pub router_counts: HashMap<String, usize>,
    /// Valid router count per UDP entry point, same rule
    pub udp_router_counts: HashMap<String, usize>,
    /// Fires when this generation is superseded; children stop, and
    /// draining connections get their grace period from it
    pub drain: watch::Receiver<bool>,
}

/// Builds generations. Owns the shared long-lived state: dialer pools,
/// TLS stores, health and sticky registries.
pub struct RouterFactory {
    entry_points_tcp: Vec<String>,
    entry_points_udp: Vec<String>,
    /// Static HTTP plane settings per TCP entry point
    http_configs: HashMap<String, EntryPointHttpConfig>,
    dialers: Arc<DialerManager>,
    tls_manager: Arc<TlsManager>,
    health_registry: Arc<HealthRegistry>,
    sticky_registry: Arc<StickyRegistry>,
    chain_builder: Arc<ChainBuilder>,
    api: Option<Arc<ApiHandler>>,
    cancel_prev: Option<watch::Sender<bool>>,
}

impl RouterFactory {
    pub fn new(
        static_config: &StaticConfig,
        chain_builder: Arc<ChainBuilder>,
        api: Option<Arc<ApiHandler>>,
    ) -> Self {
        let http_configs = static_config
            .entry_points
            .iter()
            .map(|(name, ep)| {
                let trusted_forwarders = ep
                    .forwarded_headers_trusted_ips
                    .iter()
                    .filter_map(|raw| match crate::router::rule::IpPrefix::parse(raw) {
                        Ok(prefix) => Some(prefix),
                        Err(e) => {
                            warn!(entry_point = %name, error = %e, "Ignoring trusted IP");
                            None
                        }
                    })
                    .collect();
                (
                    name.clone(),
                    EntryPointHttpConfig {
                        header_read_timeout: ep.http_header_timeout(),
                        h2c: ep.h2c,
                        trusted_forwarders,
                    },
                )
            })
            .collect();

        Self {
            entry_points_tcp: static_config.tcp_entry_points(),
            entry_points_udp: static_config.udp_entry_points(),
            http_configs,
            dialers: Arc::new(DialerManager::new()),
            tls_manager: Arc::new(TlsManager::new()),
            health_registry: Arc::new(HealthRegistry::new()),
            sticky_registry: Arc::new(StickyRegistry::new()),
            chain_builder,
            api,
            cancel_prev: None,
        }
    }

    /// Materialise a snapshot into a new generation, superseding the
    /// previous one.
    pub fn create_routers(&mut self, snapshot: &DynamicConfig) -> Generation {
        // Cancel the previous generation's children (health checkers,
        // draining connections start their grace period).
        if let Some(prev) = self.cancel_prev.take() {
            let _ = prev.send(true);
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancel_prev = Some(cancel_tx);

        let mut runtime = RuntimeConfig::new(snapshot);

        // Transports and TLS material first: everything dials through
        // them.
        self.dialers.update(&snapshot.transports);
        for error in self.tls_manager.update(&snapshot.tls) {
            warn!(error = %error, "TLS material error");
        }

        // HTTP services, with health checks as children of this
        // generation.
        let (mut http_services, service_errors) = HttpServiceManager::build(
            &snapshot.http.services,
            &self.dialers,
            &self.health_registry,
            &self.sticky_registry,
            self.api.clone(),
        );
        for (name, errors) in service_errors {
            for error in errors {
                runtime.add_service_error(&name, error);
            }
        }
        http_services.launch_health_checks(cancel_rx.clone());

        // Middlewares and HTTP routers.
        let middlewares = MiddlewareBuilder::new(snapshot.http.middlewares.clone());
        let http_manager = HttpRouterManager {
            services: &http_services,
            middlewares: &middlewares,
            entry_points: &self.entry_points_tcp,
        };

        let (plain_dispatchers, errors) =
            http_manager.build_dispatchers(&snapshot.http.routers, false);
        for (name, errors) in errors {
            for error in errors {
                runtime.add_router_error(&name, error);
            }
        }
        let (tls_dispatchers, errors) =
            http_manager.build_dispatchers(&snapshot.http.routers, true);
        for (name, errors) in errors {
            for error in errors {
                runtime.add_router_error(&name, error);
            }
        }

        let mut router_counts: HashMap<String, usize> = HashMap::new();
        let https_entry_points: Vec<String> = tls_dispatchers
            .iter()
            .filter(|(_, d)| !d.is_empty())
            .map(|(ep, _)| ep.clone())
            .collect();

        let mut http_plain: HashMap<String, HttpHandler> = HashMap::new();
        for (ep, dispatcher) in plain_dispatchers {
            *router_counts.entry(ep.clone()).or_default() += dispatcher.len();
            http_plain.insert(
                ep.clone(),
                self.chain_builder.wrap(&ep, dispatcher.into_handler()),
            );
        }
        let mut http_tls: HashMap<String, HttpHandler> = HashMap::new();
        for (ep, dispatcher) in tls_dispatchers {
            *router_counts.entry(ep.clone()).or_default() += dispatcher.len();
            http_tls.insert(
                ep.clone(),
                self.chain_builder.wrap(&ep, dispatcher.into_handler()),
            );
        }

        // TCP plane.
        let (tcp_services, errors) =
            TcpServiceManager::build(&snapshot.tcp.services, &self.dialers);
        for (name, errors) in errors {
            for error in errors {
                if let Some(info) = runtime.tcp_services.get_mut(&name) {
                    info.add_error(error);
                }
            }
        }

        let tcp_manager = TcpRouterManager {
            services: &tcp_services,
            tls_manager: &self.tls_manager,
            entry_points: &self.entry_points_tcp,
        };
        let (tcp_roots, errors) = tcp_manager.build_roots(
            &snapshot.tcp.routers,
            http_plain,
            http_tls,
            &https_entry_points,
            &self.http_configs,
        );
        for (name, errors) in errors {
            for error in errors {
                runtime.add_tcp_router_error(&name, error);
            }
        }
        for root in tcp_roots.values() {
            *router_counts.entry(root.entry_point().to_string()).or_default() +=
                root.router_count();
        }

        // UDP plane.
        let (udp_services, errors) = UdpServiceManager::build(&snapshot.udp.services);
        for (name, errors) in errors {
            for error in errors {
                if let Some(info) = runtime.udp_services.get_mut(&name) {
                    info.add_error(error);
                }
            }
        }
        let udp_manager = UdpRouterManager {
            services: &udp_services,
            entry_points: &self.entry_points_udp,
        };
        let (udp_handlers, errors) = udp_manager.build_handlers(&snapshot.udp.routers);
        for (name, errors) in errors {
            for error in errors {
                runtime.add_udp_router_error(&name, error);
            }
        }
        // A UDP entry point carries at most one router; the handler map
        // only holds entries for successfully claimed entry points.
        let udp_router_counts: HashMap<String, usize> = self
            .entry_points_udp
            .iter()
            .map(|ep| (ep.clone(), usize::from(udp_handlers.contains_key(ep))))
            .collect();

        runtime.populate_used_by();
        let runtime = Arc::new(runtime);
        if let Some(api) = &self.api {
            api.update(Arc::clone(&runtime));
        }

        info!(
            http_routers = runtime.routers.len(),
            tcp_routers = runtime.tcp_routers.len(),
            udp_routers = runtime.udp_routers.len(),
            "Built new configuration generation"
        );

        Generation {
            tcp_roots,
            udp_handlers,
            runtime,
            router_counts,
            udp_router_counts,
            drain: cancel_rx,
        }
    }
}
