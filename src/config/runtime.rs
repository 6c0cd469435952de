//! Runtime view of a configuration snapshot.
//!
//! The router factory annotates every entity with the errors discovered
//! while materialising it (unresolved references, bad rules, middleware
//! cycles). Failing entities stay visible: they are reported through the
//! API instead of failing the build. `used_by` back-links are computed in
//! one pass once all references are resolved.

use serde::Serialize;
use std::collections::BTreeMap;

use super::dynamic::{
    DynamicConfig, MiddlewareConfig, RouterConfig, ServiceConfig, TcpRouterConfig,
    TcpServiceConfig, UdpRouterConfig, UdpServiceConfig,
};

/// Entity status as reported by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Enabled,
    Disabled,
}

/// One entity plus its build-time annotations.
#[derive(Debug, Clone, Serialize)]
pub struct EntityInfo<T> {
    #[serde(flatten)]
    pub config: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub used_by: Vec<String>,
    pub status: EntityStatus,
}

impl<T> EntityInfo<T> {
    fn new(config: T) -> Self {
        Self {
            config,
            errors: Vec::new(),
            used_by: Vec::new(),
            status: EntityStatus::Enabled,
        }
    }

    /// Record an error and disable the entity.
    pub fn add_error(&mut self, err: impl Into<String>) {
        self.errors.push(err.into());
        self.status = EntityStatus::Disabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.status == EntityStatus::Enabled
    }
}

pub type RouterInfo = EntityInfo<RouterConfig>;
pub type MiddlewareInfo = EntityInfo<MiddlewareConfig>;
pub type ServiceInfo = EntityInfo<ServiceConfig>;
pub type TcpRouterInfo = EntityInfo<TcpRouterConfig>;
pub type TcpServiceInfo = EntityInfo<TcpServiceConfig>;
pub type UdpRouterInfo = EntityInfo<UdpRouterConfig>;
pub type UdpServiceInfo = EntityInfo<UdpServiceConfig>;

/// A configuration snapshot annotated for one build generation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeConfig {
    pub routers: BTreeMap<String, RouterInfo>,
    pub middlewares: BTreeMap<String, MiddlewareInfo>,
    pub services: BTreeMap<String, ServiceInfo>,
    pub tcp_routers: BTreeMap<String, TcpRouterInfo>,
    pub tcp_services: BTreeMap<String, TcpServiceInfo>,
    pub udp_routers: BTreeMap<String, UdpRouterInfo>,
    pub udp_services: BTreeMap<String, UdpServiceInfo>,
}

impl RuntimeConfig {
    pub fn new(config: &DynamicConfig) -> Self {
        Self {
            routers: config
                .http
                .routers
                .iter()
                .map(|(name, c)| (name.clone(), EntityInfo::new(c.clone())))
                .collect(),
            middlewares: config
                .http
                .middlewares
                .iter()
                .map(|(name, c)| (name.clone(), EntityInfo::new(c.clone())))
                .collect(),
            services: config
                .http
                .services
                .iter()
                .map(|(name, c)| (name.clone(), EntityInfo::new(c.clone())))
                .collect(),
            tcp_routers: config
                .tcp
                .routers
                .iter()
                .map(|(name, c)| (name.clone(), EntityInfo::new(c.clone())))
                .collect(),
            tcp_services: config
                .tcp
                .services
                .iter()
                .map(|(name, c)| (name.clone(), EntityInfo::new(c.clone())))
                .collect(),
            udp_routers: config
                .udp
                .routers
                .iter()
                .map(|(name, c)| (name.clone(), EntityInfo::new(c.clone())))
                .collect(),
            udp_services: config
                .udp
                .services
                .iter()
                .map(|(name, c)| (name.clone(), EntityInfo::new(c.clone())))
                .collect(),
        }
    }

    /// Record an error on an HTTP router.
    pub fn add_router_error(&mut self, name: &str, err: impl Into<String>) {
        if let Some(info) = self.routers.get_mut(name) {
            info.add_error(err);
        }
    }

    /// Record an error on a TCP router.
    pub fn add_tcp_router_error(&mut self, name: &str, err: impl Into<String>) {
        if let Some(info) = self.tcp_routers.get_mut(name) {
            info.add_error(err);
        }
    }

    /// Record an error on a UDP router.
    pub fn add_udp_router_error(&mut self, name: &str, err: impl Into<String>) {
        if let Some(info) = self.udp_routers.get_mut(name) {
            info.add_error(err);
        }
    }

    /// Record an error on an HTTP service.
    pub fn add_service_error(&mut self, name: &str, err: impl Into<String>) {
        if let Some(info) = self.services.get_mut(name) {
            info.add_error(err);
        }
    }

    /// Record an error on an HTTP middleware.
    pub fn add_middleware_error(&mut self, name: &str, err: impl Into<String>) {
        if let Some(info) = self.middlewares.get_mut(name) {
            info.add_error(err);
        }
    }

    /// Compute reverse `used_by` indexes from router references.
    /// Run once, after all build phases recorded their errors.
    pub fn populate_used_by(&mut self) {
        let mut middleware_users: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut service_users: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (router_name, info) in &self.routers {
            for mw in &info.config.middlewares {
                middleware_users
                    .entry(mw.clone())
                    .or_default()
                    .push(router_name.clone());
            }
            service_users
                .entry(info.config.service.clone())
                .or_default()
                .push(router_name.clone());
        }

        // Chain middlewares reference further middlewares.
        for (mw_name, info) in &self.middlewares {
            if let MiddlewareConfig::Chain(chain) = &info.config {
                for inner in &chain.middlewares {
                    middleware_users
                        .entry(inner.clone())
                        .or_default()
                        .push(mw_name.clone());
                }
            }
        }

        for (name, mut users) in middleware_users {
            if let Some(info) = self.middlewares.get_mut(&name) {
                users.sort();
                users.dedup();
                info.used_by = users;
            }
        }
        for (name, mut users) in service_users {
            if let Some(info) = self.services.get_mut(&name) {
                users.sort();
                users.dedup();
                info.used_by = users;
            }
        }

        let mut tcp_service_users: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (router_name, info) in &self.tcp_routers {
            tcp_service_users
                .entry(info.config.service.clone())
                .or_default()
                .push(router_name.clone());
        }
        for (name, mut users) in tcp_service_users {
            if let Some(info) = self.tcp_services.get_mut(&name) {
                users.sort();
                users.dedup();
                info.used_by = users;
            }
        }

        let mut udp_service_users: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (router_name, info) in &self.udp_routers {
            udp_service_users
                .entry(info.config.service.clone())
                .or_default()
                .push(router_name.clone());
        }
        for (name, mut users) in udp_service_users {
            if let Some(info) = self.udp_services.get_mut(&name) {
                users.sort();
                users.dedup();
                info.used_by = users;
            }
        }
    }

    /// Counts of enabled/disabled entities per plane, for the API overview.
    pub fn overview(&self) -> serde_json::Value {
        fn count<T>(map: &BTreeMap<String, EntityInfo<T>>) -> serde_json::Value {
            let errors = map.values().filter(|i| !i.is_enabled()).count();
            serde_json::json!({
                "total": map.len(),
                "errors": errors,
            })
        }

        serde_json::json!({
            "http": {
                "routers": count(&self.routers),
                "middlewares": count(&self.middlewares),
                "services": count(&self.services),
            },
            "tcp": {
                "routers": count(&self.tcp_routers),
                "services": count(&self.tcp_services),
            },
            "udp": {
                "routers": count(&self.udp_routers),
                "services": count(&self.udp_services),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> DynamicConfig {
        toml::from_str(
            r#"
[http.routers.api]
rule = 'PathPrefix(`/api`)'
middlewares = ["auth", "strip"]
service = "backend"

[http.routers.site]
rule = 'Host(`a.test`)'
service = "backend"

[http.middlewares.auth.basic_auth]
users = []

[http.middlewares.strip.strip_prefix]
prefixes = ["/api"]

[http.middlewares.outer.chain]
middlewares = ["auth"]

[http.services.backend.load_balancer]
servers = [{ url = "http://127.0.0.1:3000" }]

[tcp.routers.db]
rule = 'HostSNI(`db.test`)'
service = "pg"

[tcp.services.pg.load_balancer]
servers = [{ address = "127.0.0.1:5432" }]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_populate_used_by() {
        let mut runtime = RuntimeConfig::new(&sample_config());
        runtime.populate_used_by();

        assert_eq!(
            runtime.services["backend"].used_by,
            vec!["api".to_string(), "site".to_string()]
        );
        assert_eq!(
            runtime.middlewares["auth"].used_by,
            vec!["api".to_string(), "outer".to_string()]
        );
        assert_eq!(runtime.middlewares["strip"].used_by, vec!["api".to_string()]);
        assert_eq!(runtime.tcp_services["pg"].used_by, vec!["db".to_string()]);
    }

    #[test]
    fn test_error_recording_disables_entity() {
        let mut runtime = RuntimeConfig::new(&sample_config());

        runtime.add_router_error("api", "middleware \"missing\" does not exist");
        assert!(!runtime.routers["api"].is_enabled());
        assert_eq!(runtime.routers["api"].errors.len(), 1);
        assert!(runtime.routers["site"].is_enabled());

        // Unknown entity names are ignored, not panics.
        runtime.add_router_error("ghost", "nope");
    }

    #[test]
    fn test_overview_counts() {
        let mut runtime = RuntimeConfig::new(&sample_config());
        runtime.add_router_error("api", "boom");

        let overview = runtime.overview();
        assert_eq!(overview["http"]["routers"]["total"], 2);
        assert_eq!(overview["http"]["routers"]["errors"], 1);
        assert_eq!(overview["tcp"]["routers"]["total"], 1);
        assert_eq!(overview["udp"]["routers"]["total"], 0);
    }
}
