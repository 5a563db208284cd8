//! SNI-driven TLS contexts
//!
//! The HTTPS listener reads the ClientHello first, then asks the resolver for
//! the `ServerConfig` of the requested hostname. Built contexts are cached per
//! hostname for the freshness window and never past the certificate's notAfter.

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::certificate::{CertificateManager, CertificateMaterial, DEFAULT_HOSTNAME};
use crate::domain::normalize_hostname;
use crate::error::EdgeError;
use crate::registry::DomainRegistry;

struct CachedContext {
    config: Arc<ServerConfig>,
    loaded_at: Instant,
    not_after: i64,
}

impl CachedContext {
    fn is_fresh(&self, window: Duration) -> bool {
        self.loaded_at.elapsed() < window && chrono::Utc::now().timestamp() < self.not_after
    }
}

pub struct TlsResolver {
    certificates: Arc<CertificateManager>,
    registry: Arc<DomainRegistry>,
    contexts: DashMap<String, CachedContext>,
    freshness: Duration,
}

impl TlsResolver {
    pub fn new(certificates: Arc<CertificateManager>, registry: Arc<DomainRegistry>) -> Self {
        let freshness = certificates.freshness();
        Self {
            certificates,
            registry,
            contexts: DashMap::new(),
            freshness,
        }
    }

    /// Context for a handshake. Hostnames that are not registered fail; a
    /// missing SNI gets the default certificate.
    pub async fn context_for(&self, sni: Option<&str>) -> Result<Arc<ServerConfig>, EdgeError> {
        let hostname = match sni {
            Some(name) => {
                let hostname = normalize_hostname(name);
                if self.registry.get_config(&hostname).is_none() {
                    return Err(EdgeError::Certificate {
                        hostname,
                        message: "hostname is not configured".to_string(),
                    });
                }
                hostname
            }
            None => DEFAULT_HOSTNAME.to_string(),
        };

        if let Some(cached) = self.contexts.get(&hostname) {
            if cached.is_fresh(self.freshness) {
                return Ok(cached.config.clone());
            }
        }

        let material = self
            .certificates
            .get_certificate(&hostname)
            .await
            .map_err(|e| EdgeError::Certificate {
                hostname: hostname.clone(),
                message: e.to_string(),
            })?;

        let config = build_server_config(&material).map_err(|e| EdgeError::Certificate {
            hostname: hostname.clone(),
            message: e.to_string(),
        })?;

        debug!(hostname = %hostname, "Built TLS context");
        self.contexts.insert(
            hostname,
            CachedContext {
                config: config.clone(),
                loaded_at: material.loaded_at,
                not_after: material.not_after,
            },
        );
        Ok(config)
    }

    /// Drop the cached context so the next handshake reloads from storage
    pub fn invalidate(&self, hostname: &str) {
        self.contexts.remove(&normalize_hostname(hostname));
    }

    pub fn cached_count(&self) -> usize {
        self.contexts.len()
    }
}

pub fn build_server_config(material: &CertificateMaterial) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut material.cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates in PEM for {}", material.hostname));
    }

    let key = rustls_pemfile::private_key(&mut material.key_pem.as_bytes())?
        .ok_or_else(|| anyhow!("no private key for {}", material.hostname))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::self_signed_pem;
    use crate::config::CertificateConfig;
    use crate::domain::{OriginSet, UpsertOptions};
    use tempfile::{tempdir, TempDir};

    async fn setup() -> (TempDir, TlsResolver, Arc<CertificateManager>) {
        let dir = tempdir().unwrap();
        let certificates = Arc::new(
            CertificateManager::new(CertificateConfig {
                certs_dir: dir.path().join("certs"),
                ..Default::default()
            })
            .unwrap(),
        );
        let registry = Arc::new(DomainRegistry::open(
            dir.path().join("domains.json"),
            None,
            Duration::from_secs(5),
        ));
        registry
            .upsert("shop.example", OriginSet::from("http://origin.internal"), UpsertOptions::default())
            .await
            .unwrap();

        let resolver = TlsResolver::new(certificates.clone(), registry);
        (dir, resolver, certificates)
    }

    #[tokio::test]
    async fn test_context_cached_within_freshness_window() {
        let (_dir, resolver, _) = setup().await;

        let first = resolver.context_for(Some("shop.example")).await.unwrap();
        let second = resolver.context_for(Some("SHOP.example")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.cached_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_hostname_fails_handshake() {
        let (_dir, resolver, _) = setup().await;
        let result = resolver.context_for(Some("stranger.example")).await;
        assert!(matches!(result, Err(EdgeError::Certificate { .. })));
    }

    #[tokio::test]
    async fn test_missing_sni_uses_default() {
        let (_dir, resolver, _) = setup().await;
        assert!(resolver.context_for(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_forced_expiry_reprovisions() {
        let (_dir, resolver, certificates) = setup().await;

        let (cert, key) = self_signed_pem("shop.example", -1).unwrap();
        certificates.install("shop.example", cert.clone(), key).unwrap();

        let first = resolver.context_for(Some("shop.example")).await.unwrap();

        // the expired pair was replaced on disk by fresh material
        let persisted = certificates.load("shop.example").unwrap().unwrap();
        assert_ne!(persisted.cert_pem, cert);
        assert!(!persisted.is_expired());

        resolver.invalidate("shop.example");
        let (cert, key) = self_signed_pem("shop.example", -1).unwrap();
        certificates.install("shop.example", cert.clone(), key).unwrap();

        let second = resolver.context_for(Some("shop.example")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(certificates.load("shop.example").unwrap().unwrap().cert_pem, cert);
    }
}
