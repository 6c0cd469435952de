//! UDP service plane.
//!
//! A UDP service is a round-robin pool of upstream addresses. Target
//! selection happens once per client session; the session relay itself
//! lives with the entry-point listener, which owns the datagram loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::config::dynamic::UdpServiceConfig;

pub struct UdpService {
    name: String,
    servers: Vec<String>,
    counter: AtomicUsize,
}

impl UdpService {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pick the upstream for a new session.
    pub fn pick(&self) -> String {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        self.servers[index].clone()
    }
}

/// Per-generation table of UDP services.
pub struct UdpServiceManager {
    services: HashMap<String, Arc<UdpService>>,
}

impl UdpServiceManager {
    pub fn build(
        configs: &HashMap<String, UdpServiceConfig>,
    ) -> (Self, BTreeMap<String, Vec<String>>) {
        let mut services = HashMap::new();
        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (name, config) in configs {
            let UdpServiceConfig::LoadBalancer(lb) = config;

            if lb.servers.is_empty() {
                warn!(service = %name, "UDP load balancer has no servers");
                errors
                    .entry(name.clone())
                    .or_default()
                    .push("load balancer has no servers".to_string());
                continue;
            }

            services.insert(
                name.clone(),
                Arc::new(UdpService {
                    name: name.clone(),
                    servers: lb.servers.iter().map(|s| s.address.clone()).collect(),
                    counter: AtomicUsize::new(0),
                }),
            );
        }

        (Self { services }, errors)
    }

    pub fn get(&self, name: &str) -> Option<Arc<UdpService>> {
        self.services.get(name).cloned()
    }
}
