//! Configuration aggregator.
//!
//! Owns the last-seen snapshot per provider and the debounce timer:
//! every incoming message resets the timer, and only when it expires is
//! the merged snapshot emitted. Merging namespaces every entity as
//! `name@provider` and qualifies intra-provider references the same
//! way, so two providers can both define a "backend" service without
//! colliding. The most recent input always dominates: if messages keep
//! arriving, the pending emission simply keeps moving out.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::ConfigMessage;
use crate::config::DynamicConfig;

/// Debounce-and-merge loop. Calls `emit` with each settled snapshot.
pub struct Aggregator {
    rx: mpsc::UnboundedReceiver<ConfigMessage>,
    throttle: Duration,
}

impl Aggregator {
    pub fn new(rx: mpsc::UnboundedReceiver<ConfigMessage>, throttle: Duration) -> Self {
        Self { rx, throttle }
    }

    /// Run until the provider channel closes.
    pub async fn run<F>(mut self, mut emit: F)
    where
        F: FnMut(DynamicConfig),
    {
        let mut latest: HashMap<String, DynamicConfig> = HashMap::new();
        let mut deadline: Option<tokio::time::Instant> = None;

        loop {
            let sleep_until = deadline.unwrap_or_else(|| {
                // No pending emission: park far in the future.
                tokio::time::Instant::now() + Duration::from_secs(3600)
            });

            tokio::select! {
                message = self.rx.recv() => {
                    match message {
                        Some(message) => {
                            debug!(provider = %message.provider_name, "Configuration received");
                            latest.insert(message.provider_name.clone(), message.configuration);
                            // Debounce: every message pushes the timer out.
                            deadline = Some(tokio::time::Instant::now() + self.throttle);
                        }
                        None => {
                            info!("Provider channel closed, stopping aggregator");
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    deadline = None;
                    let merged = merge_configurations(&latest);
                    info!(providers = latest.len(), "Applying aggregated configuration");
                    emit(merged);
                }
            }
        }
    }
}

/// Qualify a reference with its provider namespace unless it already
/// carries one (which includes internal names like `api@internal`).
fn qualify(name: &str, provider: &str) -> String {
    if name.contains('@') {
        name.to_string()
    } else {
        format!("{}@{}", name, provider)
    }
}

/// Like `qualify`, but reserved names shared by all providers stay bare.
fn qualify_reserved(name: &str, provider: &str, reserved: &str) -> String {
    if name == reserved {
        name.to_string()
    } else {
        qualify(name, provider)
    }
}

/// Union the latest snapshot of every provider into one configuration
/// under namespaced names.
pub fn merge_configurations(latest: &HashMap<String, DynamicConfig>) -> DynamicConfig {
    let mut merged = DynamicConfig::default();

    for (provider, config) in latest {
        for (name, router) in &config.http.routers {
            let mut router = router.clone();
            router.service = qualify(&router.service, provider);
            router.middlewares = router
                .middlewares
                .iter()
                .map(|m| qualify(m, provider))
                .collect();
            if let Some(tls) = &mut router.tls {
                if let Some(options) = &tls.options {
                    tls.options = Some(qualify_reserved(options, provider, "default"));
                }
            }
            merged.http.routers.insert(qualify(name, provider), router);
        }

        for (name, middleware) in &config.http.middlewares {
            let mut middleware = middleware.clone();
            if let crate::config::dynamic::MiddlewareConfig::Chain(chain) = &mut middleware {
                chain.middlewares = chain
                    .middlewares
                    .iter()
                    .map(|m| qualify(m, provider))
                    .collect();
            }
            merged
                .http
                .middlewares
                .insert(qualify(name, provider), middleware);
        }

        for (name, service) in &config.http.services {
            use crate::config::dynamic::ServiceConfig;
            let mut service = service.clone();
            match &mut service {
                ServiceConfig::LoadBalancer(lb) => {
                    if let Some(transport) = &lb.transport {
                        lb.transport = Some(qualify_reserved(transport, provider, "default"));
                    }
                }
                ServiceConfig::Weighted(weighted) => {
                    for child in &mut weighted.services {
                        child.name = qualify(&child.name, provider);
                    }
                }
                ServiceConfig::Mirroring(mirroring) => {
                    mirroring.service = qualify(&mirroring.service, provider);
                    for mirror in &mut mirroring.mirrors {
                        mirror.name = qualify(&mirror.name, provider);
                    }
                }
                ServiceConfig::Failover(failover) => {
                    failover.service = qualify(&failover.service, provider);
                    failover.fallback = qualify(&failover.fallback, provider);
                }
            }
            merged
                .http
                .services
                .insert(qualify(name, provider), service);
        }

        for (name, router) in &config.tcp.routers {
            let mut router = router.clone();
            router.service = qualify(&router.service, provider);
            if let Some(tls) = &mut router.tls {
                if let Some(options) = &tls.options {
                    tls.options = Some(qualify_reserved(options, provider, "default"));
                }
            }
            merged.tcp.routers.insert(qualify(name, provider), router);
        }

        for (name, service) in &config.tcp.services {
            use crate::config::dynamic::TcpServiceConfig;
            let mut service = service.clone();
            let TcpServiceConfig::LoadBalancer(lb) = &mut service;
            if let Some(transport) = &lb.transport {
                lb.transport = Some(qualify_reserved(transport, provider, "default"));
            }
            merged
                .tcp
                .services
                .insert(qualify(name, provider), service);
        }

        for (name, router) in &config.udp.routers {
            let mut router = router.clone();
            router.service = qualify(&router.service, provider);
            merged.udp.routers.insert(qualify(name, provider), router);
        }
        for (name, service) in &config.udp.services {
            merged
                .udp
                .services
                .insert(qualify(name, provider), service.clone());
        }

        for (name, transport) in &config.transports {
            merged
                .transports
                .insert(qualify_reserved(name, provider, "default"), transport.clone());
        }

        for certificate in &config.tls.certificates {
            let mut certificate = certificate.clone();
            certificate.stores = certificate
                .stores
                .iter()
                .map(|s| qualify_reserved(s, provider, "default"))
                .collect();
            merged.tls.certificates.push(certificate);
        }
        for (name, options) in &config.tls.options {
            merged
                .tls
                .options
                .insert(qualify_reserved(name, provider, "default"), options.clone());
        }
        for (name, store) in &config.tls.stores {
            merged
                .tls
                .stores
                .insert(qualify_reserved(name, provider, "default"), store.clone());
        }
    }

    merged
}
