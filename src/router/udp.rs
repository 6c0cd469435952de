//! UDP router manager.
//!
//! UDP has no rule language: a router binds its entry points straight to
//! a service. At most one router may claim a UDP entry point; extra
//! claimants are a configuration error recorded on the router, and the
//! lexicographically first one keeps the entry point so the outcome is
//! stable across reloads.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

use crate::config::dynamic::UdpRouterConfig;
use crate::service::udp::{UdpService, UdpServiceManager};

/// Builds the per-entry-point UDP handler map for one generation.
pub struct UdpRouterManager<'a> {
    pub services: &'a UdpServiceManager,
    pub entry_points: &'a [String],
}

impl<'a> UdpRouterManager<'a> {
    pub fn build_handlers(
        &self,
        routers: &HashMap<String, UdpRouterConfig>,
    ) -> (HashMap<String, Arc<UdpService>>, BTreeMap<String, Vec<String>>) {
        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();

        // Deterministic claim order: sort router names first.
        let mut names: Vec<&String> = routers.keys().collect();
        names.sort();

        let mut claimed: HashMap<String, String> = HashMap::new();
        let mut handlers: HashMap<String, Arc<UdpService>> = HashMap::new();

        for name in names {
            let config = &routers[name];

            let entry_points = if config.entry_points.is_empty() {
                self.entry_points.to_vec()
            } else {
                config.entry_points.clone()
            };

            let mut router_errors = Vec::new();
            for ep in &entry_points {
                if !self.entry_points.contains(ep) {
                    router_errors.push(format!("entryPoint \"{}\" doesn't exist", ep));
                    continue;
                }
                if let Some(owner) = claimed.get(ep) {
                    router_errors.push(format!(
                        "entryPoint \"{}\" already used by router \"{}\"",
                        ep, owner
                    ));
                    continue;
                }

                match self.services.get(&config.service) {
                    Some(service) => {
                        claimed.insert(ep.clone(), name.clone());
                        handlers.insert(ep.clone(), service);
                    }
                    None => {
                        router_errors.push(format!(
                            "service \"{}\" does not exist",
                            config.service
                        ));
                    }
                }
            }

            if !router_errors.is_empty() {
                for err in &router_errors {
                    warn!(router = %name, error = %err, "UDP router error");
                }
                errors.insert(name.clone(), router_errors);
            }
        }

        (handlers, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::UdpServiceConfig;

    fn build(
        services_toml: &str,
        routers_toml: &str,
        entry_points: &[&str],
    ) -> (HashMap<String, Arc<UdpService>>, BTreeMap<String, Vec<String>>) {
        let service_configs: HashMap<String, UdpServiceConfig> =
            toml::from_str(services_toml).unwrap();
        let (services, _) = UdpServiceManager::build(&service_configs);
        let entry_points: Vec<String> = entry_points.iter().map(|s| s.to_string()).collect();
        let manager = UdpRouterManager {
            services: &services,
            entry_points: &entry_points,
        };
        manager.build_handlers(&toml::from_str(routers_toml).unwrap())
    }

    const DNS_SERVICES: &str = r#"
[resolvers.load_balancer]
servers = [{ address = "127.0.0.1:5301" }]

[other.load_balancer]
servers = [{ address = "127.0.0.1:5302" }]
"#;

    #[test]
    fn test_single_router_per_entry_point() {
        let (handlers, errors) = build(
            DNS_SERVICES,
            r#"
[dns]
entry_points = ["udp-ep"]
service = "resolvers"
"#,
            &["udp-ep"],
        );
        assert!(errors.is_empty());
        assert_eq!(handlers["udp-ep"].name(), "resolvers");
    }

    #[test]
    fn test_duplicate_claim_errors_second_router() {
        let (handlers, errors) = build(
            DNS_SERVICES,
            r#"
[aaa]
entry_points = ["udp-ep"]
service = "resolvers"

[bbb]
entry_points = ["udp-ep"]
service = "other"
"#,
            &["udp-ep"],
        );
        // Lexicographically first router wins; the other is errored.
        assert_eq!(handlers["udp-ep"].name(), "resolvers");
        assert!(!errors.contains_key("aaa"));
        assert!(errors["bbb"][0].contains("already used"));
    }

    #[test]
    fn test_unknown_service_and_entry_point() {
        let (handlers, errors) = build(
            DNS_SERVICES,
            r#"
[ghost]
entry_points = ["udp-ep"]
service = "missing"

[lost]
entry_points = ["nope"]
service = "resolvers"
"#,
            &["udp-ep"],
        );
        assert!(handlers.is_empty());
        assert!(errors["ghost"][0].contains("missing"));
        assert!(errors["lost"][0].contains("nope"));
    }
}
