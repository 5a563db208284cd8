//! Origin health monitor
//!
//! Runs on the designated process only. Each cycle probes every origin of
//! every tenant once and hands a complete health vector to the registry.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::domain::HealthRecord;
use crate::registry::DomainRegistry;

pub struct HealthMonitor {
    registry: Arc<DomainRegistry>,
    config: HealthConfig,
    client: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(registry: Arc<DomainRegistry>, config: HealthConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout)
            .user_agent("edgemux-health-check")
            .build()?;

        Ok(Self {
            registry,
            config,
            client,
        })
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "Health monitor starting"
        );

        let mut ticker = time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// One probe cycle; returns the number of tenants updated
    pub async fn check_all(&self) -> usize {
        let domains = self.registry.list_all();
        let mut updated = 0;

        for (hostname, entry) in domains {
            let mut vector = Vec::with_capacity(entry.origin.len());
            for origin in entry.origin.as_slice() {
                vector.push(self.probe(origin).await);
            }

            let healthy = vector.iter().filter(|r| r.healthy).count();
            if self.registry.set_health(&hostname, vector).await {
                updated += 1;
            }
            debug!(hostname = %hostname, healthy, total = entry.origin.len(), "Health cycle for domain");
        }

        updated
    }

    /// Probe one origin. Never fails: every error is an unhealthy record.
    pub async fn probe(&self, origin: &str) -> HealthRecord {
        let result = time::timeout(self.config.timeout, self.client.get(origin).send()).await;

        let (healthy, error) = match result {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                if (200..400).contains(&status) {
                    (true, None)
                } else {
                    warn!(origin = %origin, status, "Health check failed: bad status");
                    (false, Some(format!("HTTP {}", status)))
                }
            }
            Ok(Err(e)) => {
                warn!(origin = %origin, error = %e, "Health check failed: connection error");
                (false, Some(e.to_string()))
            }
            Err(_) => {
                warn!(origin = %origin, "Health check failed: timeout");
                (false, Some("timeout".to_string()))
            }
        };

        HealthRecord {
            origin: origin.to_string(),
            healthy,
            last_checked: Utc::now(),
            error,
        }
    }
}
