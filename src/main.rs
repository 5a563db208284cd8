//! Edgemux - Main entry point
//!
//! A multi-tenant edge proxy node

use anyhow::{Context, Result};
use clap::Parser;
use edgemux::config::{
    split_list, AcmeDirectory, CacheConfig, CertificateConfig, HealthConfig, RateLimitConfig,
    RegistryConfig,
};
use edgemux::store::SharedStore;
use edgemux::{
    Analytics, CertificateManager, DomainRegistry, EdgeConfig, EdgeServer, HealthMonitor, Shutdown,
    SqliteStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Edgemux - A multi-tenant edge proxy
#[derive(Parser, Debug)]
#[command(name = "edgemux")]
#[command(author = "Edgemux Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A multi-tenant edge proxy with per-host TLS, filtering and caching")]
struct Args {
    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value = "8443")]
    https_port: u16,

    /// Enable HTTPS server
    #[arg(long, env = "ENABLE_HTTPS", default_value = "false")]
    enable_https: bool,

    /// Force HTTPS redirect
    #[arg(long, env = "FORCE_HTTPS", default_value = "false")]
    force_https: bool,

    /// Domain snapshot file
    #[arg(long, env = "DOMAINS_FILE", default_value = "./data/domains.json")]
    domains_file: PathBuf,

    /// Shared store (SQLite path) for the process fleet
    #[arg(long, env = "SHARED_STORE")]
    shared_store: Option<PathBuf>,

    /// Registry reconciliation interval in seconds
    #[arg(long, env = "SYNC_INTERVAL_SECS", default_value = "5")]
    sync_interval_secs: u64,

    /// Certificates directory
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    certs_dir: PathBuf,

    /// Request certificates from an ACME authority
    #[arg(long, env = "ACME_ENABLED", default_value = "false")]
    acme_enabled: bool,

    /// ACME directory: staging, production or a directory URL
    #[arg(long, env = "ACME_DIRECTORY", default_value = "staging")]
    acme_directory: String,

    /// ACME account contact email
    #[arg(long, env = "ACME_EMAIL")]
    acme_email: Option<String>,

    /// Renew certificates this many days before they expire
    #[arg(long, env = "ACME_RENEW_DAYS", default_value = "30")]
    acme_renew_days: u64,

    /// Default cache TTL in seconds
    #[arg(long, env = "DEFAULT_TTL", default_value = "3600")]
    default_ttl: u64,

    /// Cache size limit in MB
    #[arg(long, env = "CACHE_MAX_SIZE_MB", default_value = "10240")]
    cache_max_size_mb: u64,

    /// Expired cache sweep interval in seconds
    #[arg(long, env = "CACHE_SWEEP_SECS", default_value = "600")]
    cache_sweep_secs: u64,

    /// Runtime worker threads (defaults to the number of CPUs)
    #[arg(long, env = "MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Run the health monitor, cache sweep and certificate renewal on this process
    #[arg(long, env = "PRIMARY", default_value = "true")]
    primary: bool,

    /// Health check interval in seconds
    #[arg(long, env = "HEALTH_CHECK_INTERVAL_SECS", default_value = "30")]
    health_check_interval_secs: u64,

    /// Health probe timeout in seconds
    #[arg(long, env = "HEALTH_CHECK_TIMEOUT_SECS", default_value = "5")]
    health_check_timeout_secs: u64,

    /// Rate limit window in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value = "900")]
    rate_limit_window_secs: u64,

    /// Requests allowed per client per window (0 disables)
    #[arg(long, env = "RATE_LIMIT_MAX", default_value = "100")]
    rate_limit_max: u32,

    /// Comma-separated IPs or CIDRs allowed on admin routes
    #[arg(long, env = "ADMIN_WHITELIST_IPS", default_value = "")]
    admin_whitelist_ips: String,

    /// Comma-separated threat-intelligence IPs or CIDRs
    #[arg(long, env = "THREAT_IPS", default_value = "")]
    threat_ips: String,

    /// Analytics snapshot file
    #[arg(long, env = "ANALYTICS_FILE", default_value = "./data/analytics.json")]
    analytics_file: PathBuf,

    /// Serve Prometheus metrics at /metrics
    #[arg(long, env = "METRICS_ENABLED", default_value = "false")]
    metrics_enabled: bool,

    /// Proxy WebSocket upgrades
    #[arg(long, env = "WEBSOCKET_ENABLED", default_value = "true")]
    websocket_enabled: bool,

    /// Seconds to wait for in-flight work at shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "10")]
    shutdown_grace_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format: text or json
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: String,

    /// Run in production mode (ports 80/443)
    #[arg(long)]
    production: bool,
}

impl Args {
    fn edge_config(&self) -> EdgeConfig {
        EdgeConfig {
            http_port: self.http_port,
            https_port: self.https_port,
            enable_https: self.enable_https,
            force_https: self.force_https,
            primary: self.primary,
            websocket_enabled: self.websocket_enabled,
            metrics_enabled: self.metrics_enabled,
            registry: RegistryConfig {
                snapshot_path: self.domains_file.clone(),
                shared_store: self.shared_store.clone(),
                sync_interval: Duration::from_secs(self.sync_interval_secs),
            },
            certificates: CertificateConfig {
                certs_dir: self.certs_dir.clone(),
                acme_enabled: self.acme_enabled,
                acme_directory: AcmeDirectory::parse(&self.acme_directory),
                acme_email: self.acme_email.clone(),
                renew_before: Duration::from_secs(self.acme_renew_days * 24 * 60 * 60),
                ..Default::default()
            },
            cache: CacheConfig {
                default_ttl: Duration::from_secs(self.default_ttl),
                max_bytes: self.cache_max_size_mb * 1024 * 1024,
                sweep_interval: Duration::from_secs(self.cache_sweep_secs),
            },
            health: HealthConfig {
                interval: Duration::from_secs(self.health_check_interval_secs),
                timeout: Duration::from_secs(self.health_check_timeout_secs),
            },
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(self.rate_limit_window_secs),
                max_requests: self.rate_limit_max,
            },
            admin_whitelist: split_list(&self.admin_whitelist_ips),
            threat_ips: split_list(&self.threat_ips),
            analytics_path: self.analytics_file.clone(),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn main() -> Result<()> {
    let mut args = Args::parse();

    // Production mode overrides
    if args.production {
        args.http_port = 80;
        args.https_port = 443;
        args.enable_https = true;
    }

    init_logging(&args.log_level, &args.log_format);

    let workers = args
        .max_workers
        .filter(|n| *n > 0)
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(run(args.edge_config(), workers))
}

async fn run(config: EdgeConfig, workers: usize) -> Result<()> {
    info!("Starting edgemux v{}", env!("CARGO_PKG_VERSION"));
    info!(
        http_port = config.http_port,
        https = config.enable_https,
        https_port = config.https_port,
        workers,
        primary = config.primary,
        "Configuration loaded"
    );

    let store: Option<Arc<dyn SharedStore>> = match &config.registry.shared_store {
        Some(path) => match SqliteStore::open(path) {
            Ok(store) => {
                info!("Shared store opened at: {}", store.db_path());
                Some(Arc::new(store))
            }
            Err(e) => {
                warn!(error = %e, "Shared store unavailable, running with local state only");
                None
            }
        },
        None => None,
    };

    let registry = Arc::new(DomainRegistry::open(
        &config.registry.snapshot_path,
        store,
        config.registry.sync_interval,
    ));
    registry.reconcile().await;

    let certificates = Arc::new(CertificateManager::new(config.certificates.clone())?);
    info!("Certificate manager initialized at: {}", certificates.certs_dir().display());

    let analytics = Arc::new(Analytics::open(&config.analytics_path));

    let mut server = EdgeServer::new(config.clone(), registry.clone(), certificates.clone(), analytics.clone())?;
    if config.metrics_enabled {
        server = server.with_metrics(edgemux::metrics::install()?);
    }
    let server = Arc::new(server);

    let shutdown = Shutdown::new();

    // Background loops
    {
        let registry = registry.clone();
        let interval = config.registry.sync_interval;
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.reconcile().await,
                    _ = stop.recv() => break,
                }
            }
        });
    }

    tokio::spawn(analytics.clone().run_flush(MAINTENANCE_INTERVAL, shutdown.subscribe()));

    {
        let limiter = server.rate_limiter().clone();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.cleanup();
                    }
                    _ = stop.recv() => break,
                }
            }
        });
    }

    if config.primary {
        let monitor = HealthMonitor::new(registry.clone(), config.health.clone())?;
        tokio::spawn(monitor.run(shutdown.subscribe()));

        let cache = server.cache().clone();
        let sweep_interval = config.cache.sweep_interval;
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            info!(removed, "Expired cache entries swept");
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
        });

        tokio::spawn(certificates.clone().run_renewal(
            registry.clone(),
            RENEWAL_INTERVAL,
            shutdown.subscribe(),
        ));
    }

    let server_task = tokio::spawn(server.clone().run(shutdown.clone()));

    info!("Edgemux started successfully");

    tokio::select! {
        result = wait_for_signal() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signals");
            }
        }
        result = server_task => {
            match result {
                Ok(Ok(())) => warn!("Listeners exited"),
                Ok(Err(e)) => error!(error = %e, "Server failed"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Stop accepting, then close tunnels and flush state within the grace period
    info!(grace_secs = config.shutdown_grace.as_secs(), "Shutting down");
    shutdown.trigger();

    let closed = server.websockets().close_all();
    info!(closed, "WebSocket tunnels closed");

    if let Err(e) = analytics.flush() {
        warn!(error = %e, "Failed to flush analytics at shutdown");
    }
    registry.persist_snapshot();

    if server.drain(config.shutdown_grace).await {
        info!("All connections drained");
    }

    info!("Edgemux stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
