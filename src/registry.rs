//! Domain registry
//!
//! Per-process replica of tenant configuration. Seeded from the on-disk
//! snapshot, written through to disk and the shared store, and lazily
//! reconciled against the shared store when an origin lookup finds the
//! replica older than the sync interval. Readers always get the current
//! replica; a reconciliation never blocks them.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::domain::{DomainEntry, HealthRecord, OriginSet, StoredEntry, UpsertOptions};
use crate::error::{EdgeError, Result};
use crate::persist::write_atomic;
use crate::store::SharedStore;

type Replica = HashMap<String, Arc<DomainEntry>>;

/// Right-biased merge: shared-store entries replace local ones with the same
/// hostname unconditionally, local-only entries survive.
pub fn merge_replicas(local: &Replica, remote: HashMap<String, DomainEntry>) -> Replica {
    let mut merged = local.clone();
    for (hostname, entry) in remote {
        merged.insert(hostname, Arc::new(entry));
    }
    merged
}

pub struct DomainRegistry {
    entries: RwLock<Replica>,
    snapshot_path: PathBuf,
    store: Option<Arc<dyn SharedStore>>,
    sync_interval: Duration,
    last_sync: Mutex<Option<Instant>>,
    refreshing: AtomicBool,
    /// Bumped on every replica replacement
    version: AtomicU64,
    last_change_seen: AtomicI64,
    /// Serializes snapshot writes within this process
    persist_lock: Mutex<()>,
}

impl DomainRegistry {
    /// Open the registry, seeding it from the snapshot file when present
    pub fn open<P: AsRef<Path>>(
        snapshot_path: P,
        store: Option<Arc<dyn SharedStore>>,
        sync_interval: Duration,
    ) -> Self {
        let snapshot_path = snapshot_path.as_ref().to_path_buf();
        let entries = Self::load_snapshot(&snapshot_path);

        info!(
            domains = entries.len(),
            snapshot = %snapshot_path.display(),
            shared_store = store.is_some(),
            "Domain registry loaded"
        );

        Self {
            entries: RwLock::new(entries),
            snapshot_path,
            store,
            sync_interval,
            last_sync: Mutex::new(None),
            refreshing: AtomicBool::new(false),
            version: AtomicU64::new(0),
            last_change_seen: AtomicI64::new(0),
            persist_lock: Mutex::new(()),
        }
    }

    fn load_snapshot(path: &Path) -> Replica {
        if !path.exists() {
            return HashMap::new();
        }

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "Failed to read domains snapshot");
                return HashMap::new();
            }
        };

        match serde_json::from_str::<HashMap<String, StoredEntry>>(&raw) {
            Ok(stored) => stored
                .into_iter()
                .map(|(hostname, entry)| {
                    let entry = entry.into_entry(&hostname);
                    (hostname, Arc::new(entry))
                })
                .collect(),
            Err(e) => {
                error!(error = %e, "Failed to parse domains snapshot");
                HashMap::new()
            }
        }
    }

    /// Origin to forward to for `hostname`, or `None` for unknown and inactive
    /// tenants. May kick off a background reconciliation.
    pub fn resolve_origin(self: &Arc<Self>, hostname: &str) -> Option<String> {
        self.maybe_refresh();

        let entries = self.entries.read();
        entries
            .get(hostname)
            .and_then(|entry| entry.select_origin().map(|o| o.to_string()))
    }

    /// Full configuration, active or not
    pub fn get_config(&self, hostname: &str) -> Option<Arc<DomainEntry>> {
        self.entries.read().get(hostname).cloned()
    }

    /// Stable-ordered copy of every entry
    pub fn list_all(&self) -> BTreeMap<String, DomainEntry> {
        self.entries
            .read()
            .iter()
            .map(|(hostname, entry)| (hostname.clone(), entry.as_ref().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Add or replace a tenant. Visible to this process immediately; other
    /// processes see it at their next reconciliation.
    pub async fn upsert(
        &self,
        hostname: &str,
        origin: OriginSet,
        options: UpsertOptions,
    ) -> Result<DomainEntry> {
        let hostname = hostname.trim().to_lowercase();
        if hostname.is_empty() {
            return Err(EdgeError::InvalidConfig("hostname is empty".to_string()));
        }
        origin.validate()?;

        let mut entry = DomainEntry::new(&hostname, origin, options);
        if let Some(existing) = self.get_config(&hostname) {
            entry.created_at = existing.created_at;
            if existing.origin == entry.origin {
                entry.health = existing.health.clone();
            }
        }

        self.replace_entry(&hostname, Some(Arc::new(entry.clone())));
        self.persist_snapshot();

        if let Some(store) = &self.store {
            if let Err(e) = store.put(&entry).await {
                warn!(hostname = %hostname, error = %e, "Shared store write failed, keeping local change");
            } else if let Err(e) = store.publish(&hostname).await {
                debug!(hostname = %hostname, error = %e, "Change notification failed");
            }
        }

        info!(hostname = %hostname, origin = ?entry.origin, plan = %entry.plan, "Domain added/updated");
        Ok(entry)
    }

    /// Remove a tenant; false when it was not registered
    pub async fn remove(&self, hostname: &str) -> bool {
        let hostname = hostname.trim().to_lowercase();
        if self.get_config(&hostname).is_none() {
            return false;
        }

        self.replace_entry(&hostname, None);
        self.persist_snapshot();

        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&hostname).await {
                warn!(hostname = %hostname, error = %e, "Shared store delete failed");
            } else if let Err(e) = store.publish(&hostname).await {
                debug!(hostname = %hostname, error = %e, "Change notification failed");
            }
        }

        info!(hostname = %hostname, "Domain removed");
        true
    }

    /// Replace the health vector of `hostname` wholesale.
    /// Vectors whose length does not match the origin count are rejected.
    pub async fn set_health(&self, hostname: &str, health: Vec<HealthRecord>) -> bool {
        let Some(current) = self.get_config(hostname) else {
            return false;
        };

        if health.len() != current.origin.len() {
            warn!(
                hostname = %hostname,
                expected = current.origin.len(),
                got = health.len(),
                "Ignoring health vector with mismatched length"
            );
            return false;
        }

        let mut updated = current.as_ref().clone();
        updated.health = Some(health.clone());
        self.replace_entry(hostname, Some(Arc::new(updated)));

        // Health travels to the serving processes through the shared store.
        // Only the health column is written; a row another process removed
        // stays removed.
        if let Some(store) = &self.store {
            match store.put_health(hostname, &health).await {
                Ok(true) => {}
                Ok(false) => debug!(hostname = %hostname, "Domain no longer in shared store, health kept local"),
                Err(e) => debug!(hostname = %hostname, error = %e, "Failed to share health status"),
            }
        }
        true
    }

    /// Copy-on-write replacement of a single entry
    fn replace_entry(&self, hostname: &str, entry: Option<Arc<DomainEntry>>) {
        let mut entries = self.entries.write();
        match entry {
            Some(entry) => {
                entries.insert(hostname.to_string(), entry);
            }
            None => {
                entries.remove(hostname);
            }
        }
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Write the current replica to the snapshot file. Failures are logged.
    pub fn persist_snapshot(&self) {
        let _guard = self.persist_lock.lock();
        let snapshot = self.list_all();

        let bytes = match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to serialize domains snapshot");
                return;
            }
        };

        if let Err(e) = write_atomic(&self.snapshot_path, &bytes) {
            error!(error = %e, path = %self.snapshot_path.display(), "Failed to save domains to disk");
        }
    }

    /// Start a background reconciliation when the replica is stale
    fn maybe_refresh(self: &Arc<Self>) {
        if self.store.is_none() {
            return;
        }

        {
            let mut last_sync = self.last_sync.lock();
            let stale = last_sync
                .map(|at| at.elapsed() > self.sync_interval)
                .unwrap_or(true);
            if !stale {
                return;
            }
            if self.refreshing.swap(true, Ordering::SeqCst) {
                return;
            }
            *last_sync = Some(Instant::now());
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.refreshing.store(false, Ordering::SeqCst);
            return;
        };

        let registry = self.clone();
        handle.spawn(async move {
            registry.reconcile().await;
            registry.refreshing.store(false, Ordering::SeqCst);
        });
    }

    /// Merge the shared store into the local replica.
    /// Store failures leave the replica untouched.
    pub async fn reconcile(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let remote = match store.load_all().await {
            Ok(remote) => remote,
            Err(e) => {
                debug!(error = %e, "Shared store unavailable, serving local state");
                return;
            }
        };

        if let Ok(change) = store.latest_change().await {
            let previous = self.last_change_seen.swap(change, Ordering::SeqCst);
            if change > previous {
                debug!(changes = change - previous, "Picked up configuration changes");
            }
        }

        let remote_count = remote.len();
        {
            let mut entries = self.entries.write();
            let merged = merge_replicas(&entries, remote);
            *entries = merged;
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        *self.last_sync.lock() = Some(Instant::now());

        debug!(remote = remote_count, total = self.len(), "Registry reconciled with shared store");
    }
}
