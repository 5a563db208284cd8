//! Edgemux - A multi-tenant edge proxy
//!
//! One process serves many tenant hostnames:
//! - Domain registry with a shared SQLite store and eventual consistency
//! - Origin health monitoring and failover selection
//! - Static WAF rules, tenant rules and sandboxed edge scripts
//! - Per-hostname TLS with ACME issuance and self-signed fallback
//! - Response cache with TTL expiry and purge
//! - WebSocket tunneling

pub mod acme;
pub mod admin;
pub mod analytics;
pub mod cache;
pub mod certificate;
pub mod config;
pub mod domain;
pub mod edge;
pub mod error;
pub mod health;
pub mod metrics;
pub mod persist;
pub mod proxy;
pub mod registry;
pub mod security;
pub mod shutdown;
pub mod store;
pub mod tls;
pub mod waf;
pub mod websocket;

pub use analytics::Analytics;
pub use cache::ResponseCache;
pub use certificate::CertificateManager;
pub use config::EdgeConfig;
pub use domain::{DomainEntry, OriginSet, UpsertOptions};
pub use error::EdgeError;
pub use health::HealthMonitor;
pub use proxy::EdgeServer;
pub use registry::DomainRegistry;
pub use shutdown::Shutdown;
pub use store::{SharedStore, SqliteStore};
