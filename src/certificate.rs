//! Certificate manager for per-hostname TLS material
//! Loads persisted pairs, provisions through ACME when enabled and falls back
//! to self-signed certificates otherwise.

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, warn};

use crate::acme::{AcmeIssuer, ChallengeStore};
use crate::config::CertificateConfig;
use crate::persist::write_atomic;
use crate::registry::DomainRegistry;

/// Hostname whose certificate is served when a client sends no SNI
pub const DEFAULT_HOSTNAME: &str = "localhost";

const SELF_SIGNED_VALIDITY_DAYS: i64 = 365;

/// Where a hostname's persisted certificate stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateStatus {
    Absent,
    Valid,
    /// Still valid but inside the renewal window
    Expiring,
    /// Past notAfter or unreadable
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionMethod {
    Acme,
    SelfSigned,
}

impl ProvisionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionMethod::Acme => "acme",
            ProvisionMethod::SelfSigned => "self-signed",
        }
    }
}

/// Certificate chain and key for one hostname
#[derive(Debug, Clone)]
pub struct CertificateMaterial {
    pub hostname: String,
    pub cert_pem: String,
    pub key_pem: String,
    /// Unix timestamp
    pub not_after: i64,
    pub loaded_at: Instant,
}

impl CertificateMaterial {
    pub fn from_pem(hostname: &str, cert_pem: String, key_pem: String) -> Result<Self> {
        let not_after = read_not_after(&cert_pem)?;

        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?;
        if key.is_none() {
            return Err(anyhow!("no private key found for {}", hostname));
        }

        Ok(Self {
            hostname: hostname.to_string(),
            cert_pem,
            key_pem,
            not_after,
            loaded_at: Instant::now(),
        })
    }

    pub fn is_expired(&self) -> bool {
        chrono::Utc::now().timestamp() >= self.not_after
    }

    pub fn expires_within(&self, window: Duration) -> bool {
        chrono::Utc::now().timestamp() + window.as_secs() as i64 >= self.not_after
    }
}

/// notAfter of the first certificate in a PEM bundle
pub fn read_not_after(cert_pem: &str) -> Result<i64> {
    use x509_parser::prelude::*;

    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| anyhow!("Failed to parse PEM: {:?}", e))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| anyhow!("Failed to parse certificate: {:?}", e))?;

    Ok(cert.validity().not_after.timestamp())
}

/// Rate limiting state for CA requests
struct RateLimitState {
    last_request: Instant,
    weekly_count: u32,
    week_start: Instant,
}

const ISSUANCE_COOLDOWN: Duration = Duration::from_secs(5 * 60);
const ISSUANCE_WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const ISSUANCE_WEEKLY_LIMIT: u32 = 5;

/// Certificate manager for handling per-hostname certificates
pub struct CertificateManager {
    config: CertificateConfig,
    challenges: Arc<ChallengeStore>,
    rate_limits: DashMap<String, RateLimitState>,
    /// Serializes provisioning per hostname
    host_locks: DashMap<String, Arc<TokioMutex<()>>>,
    acme: Option<AcmeIssuer>,
}

impl CertificateManager {
    pub fn new(config: CertificateConfig) -> Result<Self> {
        fs::create_dir_all(&config.certs_dir)?;

        let challenges = Arc::new(ChallengeStore::new());
        let acme = if config.acme_enabled {
            info!(directory = %config.acme_directory.url(), "ACME issuance enabled");
            Some(AcmeIssuer::new(
                config.acme_directory.url(),
                config.acme_email.clone(),
                config.certs_dir.join("acme-account.json"),
                challenges.clone(),
            ))
        } else {
            None
        };

        let manager = Self {
            config,
            challenges,
            rate_limits: DashMap::new(),
            host_locks: DashMap::new(),
            acme,
        };

        manager.ensure_default_cert()?;

        Ok(manager)
    }

    /// Make sure the no-SNI fallback certificate exists and is usable
    fn ensure_default_cert(&self) -> Result<()> {
        match self.load(DEFAULT_HOSTNAME) {
            Ok(Some(material)) if !material.is_expired() => Ok(()),
            _ => {
                info!("Generating default self-signed certificate");
                self.generate_self_signed(DEFAULT_HOSTNAME)?;
                Ok(())
            }
        }
    }

    /// Sanitize domain name for filesystem
    fn sanitize_domain(domain: &str) -> String {
        domain
            .replace('*', "wildcard")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>()
            .trim_start_matches('.')
            .to_string()
    }

    pub fn cert_paths(&self, hostname: &str) -> (PathBuf, PathBuf) {
        let name = Self::sanitize_domain(hostname);
        (
            self.config.certs_dir.join(format!("{}.crt", name)),
            self.config.certs_dir.join(format!("{}.key", name)),
        )
    }

    /// Persisted material; `Ok(None)` when nothing is stored
    pub fn load(&self, hostname: &str) -> Result<Option<CertificateMaterial>> {
        let (cert_path, key_path) = self.cert_paths(hostname);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pem = fs::read_to_string(&key_path)?;
        CertificateMaterial::from_pem(hostname, cert_pem, key_pem).map(Some)
    }

    pub fn status(&self, hostname: &str) -> CertificateStatus {
        match self.load(hostname) {
            Ok(None) => CertificateStatus::Absent,
            Ok(Some(material)) if material.is_expired() => CertificateStatus::Invalid,
            Ok(Some(material)) if material.expires_within(self.config.renew_before) => {
                CertificateStatus::Expiring
            }
            Ok(Some(_)) => CertificateStatus::Valid,
            Err(e) => {
                debug!(hostname = %hostname, error = %e, "Persisted certificate unreadable");
                CertificateStatus::Invalid
            }
        }
    }

    fn host_lock(&self, hostname: &str) -> Arc<TokioMutex<()>> {
        self.host_locks
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    /// Certificate for `hostname`, provisioning when none is usable.
    ///
    /// An expiring certificate is renewed through ACME when possible and kept
    /// otherwise; a missing or expired one is replaced, falling back to
    /// self-signed material.
    pub async fn get_certificate(&self, hostname: &str) -> Result<CertificateMaterial> {
        let lock = self.host_lock(hostname);
        let _guard = lock.lock().await;

        let existing = match self.load(hostname) {
            Ok(existing) => existing,
            Err(e) => {
                warn!(hostname = %hostname, error = %e, "Persisted certificate invalid, re-provisioning");
                None
            }
        };

        match existing {
            Some(material) if !material.expires_within(self.config.renew_before) => Ok(material),
            Some(material) if !material.is_expired() => {
                if self.acme.is_none() {
                    return Ok(material);
                }
                match self.provision(hostname, false).await {
                    Ok((renewed, _)) => Ok(renewed),
                    Err(e) => {
                        warn!(hostname = %hostname, error = %e, "Renewal failed, serving current certificate");
                        Ok(material)
                    }
                }
            }
            _ => {
                if existing_expired(&self.cert_paths(hostname).0) {
                    info!(hostname = %hostname, "SSL certificate expired, renewing");
                }
                self.provision(hostname, true).await.map(|(m, _)| m)
            }
        }
    }

    /// Provision now regardless of the current state (admin endpoint)
    pub async fn provision_now(&self, hostname: &str) -> Result<ProvisionMethod> {
        let lock = self.host_lock(hostname);
        let _guard = lock.lock().await;
        self.provision(hostname, true).await.map(|(_, method)| method)
    }

    /// Issue new material and persist it. Callers hold the host lock.
    async fn provision(
        &self,
        hostname: &str,
        allow_self_signed: bool,
    ) -> Result<(CertificateMaterial, ProvisionMethod)> {
        if let Some(acme) = &self.acme {
            if self.is_rate_limited(hostname) {
                warn!(hostname = %hostname, "ACME issuance throttled");
            } else {
                self.update_rate_limit(hostname);
                match acme.issue(hostname).await {
                    Ok((cert_pem, key_pem)) => {
                        let material = self.install(hostname, cert_pem, key_pem)?;
                        crate::metrics::record_certificate(ProvisionMethod::Acme.as_str());
                        return Ok((material, ProvisionMethod::Acme));
                    }
                    Err(e) => {
                        error!(hostname = %hostname, error = %e, "SSL provisioning failed");
                    }
                }
            }
        }

        if !allow_self_signed {
            return Err(anyhow!("no certificate authority available for {}", hostname));
        }

        let material = self.generate_self_signed(hostname)?;
        crate::metrics::record_certificate(ProvisionMethod::SelfSigned.as_str());
        Ok((material, ProvisionMethod::SelfSigned))
    }

    /// Generate and persist a one-year self-signed certificate
    pub fn generate_self_signed(&self, hostname: &str) -> Result<CertificateMaterial> {
        let (cert_pem, key_pem) = self_signed_pem(hostname, SELF_SIGNED_VALIDITY_DAYS)?;
        let material = self.install(hostname, cert_pem, key_pem)?;
        info!(hostname = %hostname, "Generated self-signed certificate");
        Ok(material)
    }

    /// Validate and persist a certificate pair. Key first, so a crash never
    /// leaves a new certificate next to an old key.
    pub fn install(&self, hostname: &str, cert_pem: String, key_pem: String) -> Result<CertificateMaterial> {
        let material = CertificateMaterial::from_pem(hostname, cert_pem, key_pem)?;
        let (cert_path, key_path) = self.cert_paths(hostname);

        write_atomic(&key_path, material.key_pem.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }
        write_atomic(&cert_path, material.cert_pem.as_bytes())?;

        Ok(material)
    }

    /// Check if domain is rate limited
    fn is_rate_limited(&self, domain: &str) -> bool {
        if let Some(state) = self.rate_limits.get(domain) {
            let now = Instant::now();

            if now.duration_since(state.last_request) < ISSUANCE_COOLDOWN {
                return true;
            }

            if now.duration_since(state.week_start) < ISSUANCE_WEEK
                && state.weekly_count >= ISSUANCE_WEEKLY_LIMIT
            {
                return true;
            }
        }
        false
    }

    /// Update rate limit state
    fn update_rate_limit(&self, domain: &str) {
        let now = Instant::now();
        self.rate_limits
            .entry(domain.to_string())
            .and_modify(|state| {
                if now.duration_since(state.week_start) >= ISSUANCE_WEEK {
                    state.week_start = now;
                    state.weekly_count = 1;
                } else {
                    state.weekly_count += 1;
                }
                state.last_request = now;
            })
            .or_insert(RateLimitState {
                last_request: now,
                weekly_count: 1,
                week_start: now,
            });
    }

    /// Get ACME challenge response
    pub fn get_acme_challenge(&self, token: &str) -> Option<String> {
        self.challenges.get(token)
    }

    pub fn challenges(&self) -> &Arc<ChallengeStore> {
        &self.challenges
    }

    pub fn certs_dir(&self) -> &Path {
        &self.config.certs_dir
    }

    pub fn freshness(&self) -> Duration {
        self.config.context_freshness
    }

    /// Re-provision every listed hostname whose certificate is expiring or
    /// expired. Hostnames without a certificate are left to the handshake path.
    pub async fn renew_expiring(&self, hostnames: &[String]) -> usize {
        let mut renewed = 0;
        for hostname in hostnames {
            match self.status(hostname) {
                CertificateStatus::Expiring | CertificateStatus::Invalid => {
                    let before = self.load(hostname).ok().flatten().map(|m| m.not_after);
                    match self.get_certificate(hostname).await {
                        Ok(material) if Some(material.not_after) != before => renewed += 1,
                        Ok(_) => {}
                        Err(e) => error!(hostname = %hostname, error = %e, "Certificate renewal failed"),
                    }
                }
                CertificateStatus::Absent | CertificateStatus::Valid => {}
            }
        }
        renewed
    }

    /// Periodic renewal on the designated process
    pub async fn run_renewal(
        self: Arc<Self>,
        registry: Arc<DomainRegistry>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let hostnames: Vec<String> = registry.list_all().into_keys().collect();
                    let renewed = self.renew_expiring(&hostnames).await;
                    if renewed > 0 {
                        info!(renewed, "Certificates renewed");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Certificate renewal loop stopping");
                    break;
                }
            }
        }
    }
}

fn existing_expired(cert_path: &Path) -> bool {
    fs::read_to_string(cert_path)
        .ok()
        .and_then(|pem| read_not_after(&pem).ok())
        .map(|not_after| chrono::Utc::now().timestamp() >= not_after)
        .unwrap_or(false)
}

/// Self-signed pair valid from yesterday for `days` days. Negative `days`
/// produces an already-expired certificate.
pub fn self_signed_pem(hostname: &str, days: i64) -> Result<(String, String)> {
    let mut params = CertificateParams::new(vec![hostname.to_string()]);
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, hostname);
    params.distinguished_name = name;

    let now = time::OffsetDateTime::now_utc();
    if days >= 0 {
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(days);
    } else {
        params.not_before = now + time::Duration::days(days - 1);
        params.not_after = now + time::Duration::days(days);
    }

    let cert = Certificate::from_params(params)?;
    Ok((cert.serialize_pem()?, cert.serialize_private_key_pem()))
}
