//! TLS management: named certificate stores, SNI resolution, client auth.
//!
//! Stores are read-mostly: lookups happen on every TLS handshake, updates
//! only on configuration reload, so the whole store is swapped
//! copy-on-write behind an [`ArcSwap`]. SNI resolution is exact match
//! first, then single-label wildcard, then the store's default
//! certificate.

use arc_swap::ArcSwap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::dynamic::{
    ClientAuthPolicy, TlsDynamicConfig, TlsOptionConfig,
};
use crate::error::{FluxgateError, FluxgateResult};
use crate::router::rule::normalize_host;

mod verifier;

pub const DEFAULT_STORE: &str = "default";
pub const DEFAULT_OPTIONS: &str = "default";

/// One named certificate store: exact and wildcard lookup tables plus an
/// optional default certificate.
#[derive(Default)]
struct CertStore {
    /// Exact server name -> certified key
    exact: HashMap<String, Arc<CertifiedKey>>,
    /// Wildcard base domain (the part after "*.") -> certified key
    wildcard: HashMap<String, Arc<CertifiedKey>>,
    default: Option<Arc<CertifiedKey>>,
}

impl CertStore {
    /// SNI lookup: exact match, then single-label wildcard, then default.
    fn lookup(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(key) = self.exact.get(server_name) {
            return Some(Arc::clone(key));
        }

        // `*.example.com` matches `a.example.com`, not `a.b.example.com`:
        // strip exactly one leading label and look up the remainder.
        if let Some((_, base)) = server_name.split_once('.') {
            if let Some(key) = self.wildcard.get(base) {
                return Some(Arc::clone(key));
            }
        }

        self.default.as_ref().map(Arc::clone)
    }
}

/// Immutable snapshot of all stores and options for one generation.
#[derive(Default)]
struct TlsSnapshot {
    stores: HashMap<String, CertStore>,
    options: HashMap<String, TlsOptionConfig>,
}

/// Named TLS store and options manager, shared by every listener.
pub struct TlsManager {
    snapshot: ArcSwap<TlsSnapshot>,
}

impl Default for TlsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsManager {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(TlsSnapshot::default()),
        }
    }

    /// Rebuild all stores from a dynamic configuration and swap them in.
    /// Certificates that fail to load are skipped with a logged error;
    /// the returned list carries those errors for the runtime config.
    pub fn update(&self, config: &TlsDynamicConfig) -> Vec<String> {
        let mut errors = Vec::new();
        let mut stores: HashMap<String, CertStore> = HashMap::new();

        for cert_config in &config.certificates {
            let key = match load_certified_key(&cert_config.cert_file, &cert_config.key_file) {
                Ok(key) => Arc::new(key),
                Err(e) => {
                    warn!(cert = %cert_config.cert_file, error = %e, "Skipping certificate");
                    errors.push(format!(
                        "certificate {}: {}",
                        cert_config.cert_file, e
                    ));
                    continue;
                }
            };

            let store_names: Vec<String> = if cert_config.stores.is_empty() {
                vec![DEFAULT_STORE.to_string()]
            } else {
                cert_config.stores.clone()
            };

            for store_name in store_names {
                let store = stores.entry(store_name).or_default();
                for domain in &cert_config.domains {
                    if let Some(base) = domain.strip_prefix("*.") {
                        store
                            .wildcard
                            .insert(normalize_host(base), Arc::clone(&key));
                    } else {
                        store
                            .exact
                            .insert(normalize_host(domain), Arc::clone(&key));
                    }
                }
            }
        }

        for (store_name, store_config) in &config.stores {
            let store = stores.entry(store_name.clone()).or_default();
            if let Some(default_cert) = &store_config.default_certificate {
                match load_certified_key(&default_cert.cert_file, &default_cert.key_file) {
                    Ok(key) => store.default = Some(Arc::new(key)),
                    Err(e) => {
                        warn!(store = %store_name, error = %e, "Skipping default certificate");
                        errors.push(format!(
                            "store {} default certificate: {}",
                            store_name, e
                        ));
                    }
                }
            }
        }

        let snapshot = TlsSnapshot {
            stores,
            options: config.options.clone(),
        };
        self.snapshot.store(Arc::new(snapshot));
        errors
    }

    /// Resolve a certificate for an SNI name out of a named store.
    pub fn lookup(&self, store_name: &str, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let snapshot = self.snapshot.load();
        snapshot
            .stores
            .get(store_name)?
            .lookup(&normalize_host(server_name))
    }

    /// Build a rustls server configuration for the given named options.
    /// The SNI certificate resolver reads through to the current store
    /// snapshot, so certificate updates do not require rebuilding the
    /// acceptor.
    pub fn server_config(
        self: &Arc<Self>,
        options_name: &str,
    ) -> FluxgateResult<Arc<ServerConfig>> {
        let snapshot = self.snapshot.load();
        let options = match snapshot.options.get(options_name) {
            Some(options) => options.clone(),
            None if options_name == DEFAULT_OPTIONS => TlsOptionConfig::default(),
            None => {
                return Err(FluxgateError::config(format!(
                    "unknown TLS options '{}'",
                    options_name
                )))
            }
        };

        let versions: &[&rustls::SupportedProtocolVersion] =
            match options.min_version.as_deref() {
                None | Some("1.2") => rustls::ALL_VERSIONS,
                Some("1.3") => &[&rustls::version::TLS13],
                Some(other) => {
                    return Err(FluxgateError::config(format!(
                        "unsupported minimum TLS version '{}'",
                        other
                    )))
                }
            };

        let builder = ServerConfig::builder_with_protocol_versions(versions);

        let builder = match &options.client_auth {
            None => builder.with_no_client_auth(),
            Some(client_auth) => match client_auth.policy {
                ClientAuthPolicy::NoClientCert => builder.with_no_client_auth(),
                ClientAuthPolicy::RequestClientCert => {
                    builder.with_client_cert_verifier(Arc::new(verifier::AcceptAnyClientCert::new()))
                }
                ClientAuthPolicy::VerifyIfGiven | ClientAuthPolicy::RequireAndVerify => {
                    let roots = load_client_ca_roots(&client_auth.ca_files)?;
                    let verifier_builder = WebPkiClientVerifier::builder(Arc::new(roots));
                    let verifier_builder =
                        if client_auth.policy == ClientAuthPolicy::VerifyIfGiven {
                            verifier_builder.allow_unauthenticated()
                        } else {
                            verifier_builder
                        };
                    let verifier = verifier_builder.build().map_err(|e| {
                        FluxgateError::tls(format!("client CA verifier: {}", e))
                    })?;
                    builder.with_client_cert_verifier(verifier)
                }
            },
        };

        let resolver = SniResolver {
            manager: Arc::clone(self),
            store_name: DEFAULT_STORE.to_string(),
        };
        let mut server_config = builder.with_cert_resolver(Arc::new(resolver));

        if options.alpn_protocols.is_empty() {
            server_config.alpn_protocols =
                vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        } else {
            server_config.alpn_protocols = options
                .alpn_protocols
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect();
        }

        Ok(Arc::new(server_config))
    }
}

/// rustls certificate resolver backed by the manager's current snapshot.
struct SniResolver {
    manager: Arc<TlsManager>,
    store_name: String,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("store", &self.store_name)
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(server_name) => {
                let resolved = self.manager.lookup(&self.store_name, server_name);
                if resolved.is_none() {
                    debug!(server_name = %server_name, "No certificate for SNI");
                }
                resolved
            }
            None => {
                // No SNI: only the default certificate can serve.
                let snapshot = self.manager.snapshot.load();
                snapshot
                    .stores
                    .get(&self.store_name)
                    .and_then(|s| s.default.as_ref().map(Arc::clone))
            }
        }
    }
}

/// Load a certificate chain and private key from PEM files.
pub fn load_certificate_and_key(
    cert_path: &str,
    key_path: &str,
) -> FluxgateResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file = File::open(cert_path).map_err(|e| {
        FluxgateError::io(format!(
            "failed to open certificate file {}: {}",
            cert_path, e
        ))
    })?;
    let mut cert_reader = BufReader::new(cert_file);
    let cert_chain = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FluxgateError::tls(format!("failed to parse certificate: {}", e)))?;

    if cert_chain.is_empty() {
        return Err(FluxgateError::tls(format!(
            "no certificates found in {}",
            cert_path
        )));
    }

    let key_file = File::open(key_path).map_err(|e| {
        FluxgateError::io(format!(
            "failed to open private key file {}: {}",
            key_path, e
        ))
    })?;
    let mut key_reader = BufReader::new(key_file);
    let private_key = private_key(&mut key_reader)
        .map_err(|e| FluxgateError::tls(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| FluxgateError::tls(format!("no private key found in {}", key_path)))?;

    Ok((cert_chain, private_key))
}

fn load_certified_key(cert_path: &str, key_path: &str) -> FluxgateResult<CertifiedKey> {
    let (cert_chain, private_key) = load_certificate_and_key(cert_path, key_path)?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
        .map_err(|e| FluxgateError::tls(format!("unsupported private key type: {}", e)))?;
    Ok(CertifiedKey::new(cert_chain, signing_key))
}

fn load_client_ca_roots(ca_files: &[String]) -> FluxgateResult<RootCertStore> {
    if ca_files.is_empty() {
        return Err(FluxgateError::config(
            "client auth requires at least one CA file",
        ));
    }

    let mut roots = RootCertStore::empty();
    for path in ca_files {
        let file = File::open(path)
            .map_err(|e| FluxgateError::io(format!("failed to open CA file {}: {}", path, e)))?;
        let mut reader = BufReader::new(file);
        for cert in certs(&mut reader) {
            let cert =
                cert.map_err(|e| FluxgateError::tls(format!("failed to parse CA {}: {}", path, e)))?;
            roots
                .add(cert)
                .map_err(|e| FluxgateError::tls(format!("failed to add CA from {}: {}", path, e)))?;
        }
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::CertificateConfig;

    #[test]
    fn test_store_lookup_precedence() {
        // Exercise the lookup table logic directly with sentinel pointers.
        let exact = certified_sentinel();
        let wild = certified_sentinel();
        let fallback = certified_sentinel();

        let mut store = CertStore::default();
        store.exact.insert("a.example.com".into(), Arc::clone(&exact));
        store
            .wildcard
            .insert("example.com".into(), Arc::clone(&wild));
        store.default = Some(Arc::clone(&fallback));

        // Exact beats wildcard.
        assert!(Arc::ptr_eq(&store.lookup("a.example.com").unwrap(), &exact));
        // Single-label wildcard match.
        assert!(Arc::ptr_eq(&store.lookup("b.example.com").unwrap(), &wild));
        // Two labels deep does not match the wildcard; falls to default.
        assert!(Arc::ptr_eq(
            &store.lookup("x.y.example.com").unwrap(),
            &fallback
        ));
        // Unrelated host falls to default.
        assert!(Arc::ptr_eq(&store.lookup("other.test").unwrap(), &fallback));

        store.default = None;
        assert!(store.lookup("other.test").is_none());
    }

    fn certified_sentinel() -> Arc<CertifiedKey> {
        use rustls::pki_types::PrivatePkcs8KeyDer;

        // A structurally valid PKCS#8 Ed25519 key used only as an Arc
        // identity in lookup tests.
        const ED25519_PKCS8: &[u8] = &[
            0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22,
            0x04, 0x20, 0x9d, 0x61, 0xb1, 0x9d, 0xef, 0xfd, 0x5a, 0x60, 0xba, 0x84, 0x4a, 0xf4,
            0x92, 0xec, 0x2c, 0xc4, 0x44, 0x49, 0xc5, 0x69, 0x7b, 0x32, 0x69, 0x19, 0x70, 0x3b,
            0xac, 0x03, 0x1c, 0xae, 0x7f, 0x60,
        ];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(ED25519_PKCS8.to_vec()));
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
            .expect("ed25519 test key");
        Arc::new(CertifiedKey::new(Vec::new(), signing_key))
    }

    #[test]
    fn test_update_skips_missing_certificates() {
        let manager = TlsManager::new();
        let config = TlsDynamicConfig {
            certificates: vec![CertificateConfig {
                cert_file: "/nonexistent/cert.pem".to_string(),
                key_file: "/nonexistent/key.pem".to_string(),
                domains: vec!["a.test".to_string()],
                stores: vec![],
            }],
            ..Default::default()
        };

        let errors = manager.update(&config);
        assert_eq!(errors.len(), 1);
        assert!(manager.lookup(DEFAULT_STORE, "a.test").is_none());
    }

    #[test]
    fn test_server_config_unknown_options() {
        let manager = Arc::new(TlsManager::new());
        manager.update(&TlsDynamicConfig::default());

        // Default options work even when never declared.
        assert!(manager.server_config(DEFAULT_OPTIONS).is_ok());
        // Unknown named options are a config error.
        assert!(manager.server_config("mystery").is_err());
    }

    #[test]
    fn test_server_config_alpn() {
        let mut options = HashMap::new();
        options.insert(
            "h2only".to_string(),
            TlsOptionConfig {
                alpn_protocols: vec!["h2".to_string()],
                ..Default::default()
            },
        );
        let manager = Arc::new(TlsManager::new());
        manager.update(&TlsDynamicConfig {
            options,
            ..Default::default()
        });

        let config = manager.server_config("h2only").unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }
}
