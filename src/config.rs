//! Runtime configuration for the edge node
//!
//! The binaries build these from CLI flags and environment variables; the
//! library only ever sees the plain structs below.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub http_port: u16,
    pub https_port: u16,
    pub enable_https: bool,
    pub force_https: bool,
    /// Runs the health monitor, cache sweep and certificate renewal loops
    pub primary: bool,
    pub websocket_enabled: bool,
    pub metrics_enabled: bool,
    pub registry: RegistryConfig,
    pub certificates: CertificateConfig,
    pub cache: CacheConfig,
    pub health: HealthConfig,
    pub rate_limit: RateLimitConfig,
    pub admin_whitelist: Vec<String>,
    pub threat_ips: Vec<String>,
    pub analytics_path: PathBuf,
    pub shutdown_grace: Duration,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            https_port: 8443,
            enable_https: false,
            force_https: false,
            primary: true,
            websocket_enabled: true,
            metrics_enabled: false,
            registry: RegistryConfig::default(),
            certificates: CertificateConfig::default(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            admin_whitelist: Vec::new(),
            threat_ips: Vec::new(),
            analytics_path: PathBuf::from("./data/analytics.json"),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Domain registry persistence and reconciliation
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub snapshot_path: PathBuf,
    /// SQLite file shared by every process in the fleet
    pub shared_store: Option<PathBuf>,
    pub sync_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("./data/domains.json"),
            shared_store: None,
            sync_interval: Duration::from_secs(5),
        }
    }
}

/// Which certificate authority directory to talk to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcmeDirectory {
    Staging,
    Production,
    Custom(String),
}

impl AcmeDirectory {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "production" | "prod" => AcmeDirectory::Production,
            "staging" | "" => AcmeDirectory::Staging,
            _ => AcmeDirectory::Custom(value.trim().to_string()),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            AcmeDirectory::Staging => "https://acme-staging-v02.api.letsencrypt.org/directory",
            AcmeDirectory::Production => "https://acme-v02.api.letsencrypt.org/directory",
            AcmeDirectory::Custom(url) => url,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CertificateConfig {
    pub certs_dir: PathBuf,
    pub acme_enabled: bool,
    pub acme_directory: AcmeDirectory,
    pub acme_email: Option<String>,
    /// Re-provision when the persisted certificate expires within this window
    pub renew_before: Duration,
    /// Reuse a built TLS context for this long before reloading it
    pub context_freshness: Duration,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            certs_dir: PathBuf::from("./certs"),
            acme_enabled: false,
            acme_directory: AcmeDirectory::Staging,
            acme_email: None,
            renew_before: Duration::from_secs(30 * 24 * 60 * 60),
            context_freshness: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub max_bytes: u64,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_bytes: 10240 * 1024 * 1024,
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Fixed-window limit per client IP. `max_requests == 0` disables it.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_requests: 100,
        }
    }
}

/// Split a comma-separated env value into trimmed, non-empty items
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
