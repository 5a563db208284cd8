//! Shared configuration store
//! SQLite database file reachable by every process in the fleet. Holds the
//! authoritative domain rows plus a change-notification table.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::domain::{DomainEntry, HealthRecord, StoredEntry};
use crate::error::{EdgeError, Result};

/// Change notifications kept in `config_updates`; older rows are pruned
const CHANGE_LOG_LIMIT: i64 = 1000;

/// Cross-process store the registry reconciles against.
/// Every failure is reported to the caller, who treats it as "use local state".
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Every domain currently in the store
    async fn load_all(&self) -> Result<HashMap<String, DomainEntry>>;

    /// Insert or replace one domain
    async fn put(&self, entry: &DomainEntry) -> Result<()>;

    /// Replace the health vector of an existing domain, leaving its
    /// configuration alone. Returns false when the domain is not in the store.
    async fn put_health(&self, hostname: &str, health: &[HealthRecord]) -> Result<bool>;

    /// Remove one domain
    async fn delete(&self, hostname: &str) -> Result<()>;

    /// Append a change notification for `hostname`
    async fn publish(&self, hostname: &str) -> Result<()>;

    /// Id of the newest change notification, 0 when there is none
    async fn latest_change(&self) -> Result<i64>;
}

/// Thread-safe SQLite-backed shared store.
/// One connection per process, serialized behind a mutex; cross-process safety
/// comes from SQLite's own locking in WAL mode.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl SqliteStore {
    /// Open (or create) the shared store
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;

        // WAL for concurrent readers across processes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_secs(2))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: db_path_str,
        };

        store.initialize()?;

        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS domains (
                hostname TEXT PRIMARY KEY,
                config TEXT NOT NULL,
                health TEXT,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        // Stores created before health had its own column
        let has_health = conn
            .prepare("SELECT 1 FROM pragma_table_info('domains') WHERE name = 'health'")?
            .exists([])?;
        if !has_health {
            conn.execute("ALTER TABLE domains ADD COLUMN health TEXT", [])?;
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS config_updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_config_updates_hostname ON config_updates(hostname)",
            [],
        )?;

        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Run a blocking closure against the connection off the async executor
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| EdgeError::Store(format!("store task failed: {}", e)))?
    }
}

#[async_trait]
impl SharedStore for SqliteStore {
    async fn load_all(&self) -> Result<HashMap<String, DomainEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT hostname, config, health FROM domains")?;
            let mut rows = stmt.query([])?;

            let mut domains = HashMap::new();
            while let Some(row) = rows.next()? {
                let hostname: String = row.get(0)?;
                let config: String = row.get(1)?;
                let health: Option<String> = row.get(2)?;
                match serde_json::from_str::<StoredEntry>(&config) {
                    Ok(stored) => {
                        let mut entry = stored.into_entry(&hostname);
                        if let Some(records) = health
                            .and_then(|raw| serde_json::from_str::<Vec<HealthRecord>>(&raw).ok())
                        {
                            // Health recorded for an older origin set is stale
                            if entry.health_matches(&records) {
                                entry.health = Some(records);
                            }
                        }
                        domains.insert(hostname, entry);
                    }
                    Err(e) => {
                        warn!(hostname = %hostname, error = %e, "Skipping unreadable shared-store row");
                    }
                }
            }
            Ok(domains)
        })
        .await
    }

    async fn put(&self, entry: &DomainEntry) -> Result<()> {
        let hostname = entry.hostname.clone();
        let config = serde_json::to_string(entry)?;
        let health = entry.health.as_ref().map(serde_json::to_string).transpose()?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO domains (hostname, config, health, updated_at)
                 VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
                 ON CONFLICT(hostname) DO UPDATE SET config = excluded.config,
                                                     health = excluded.health,
                                                     updated_at = CURRENT_TIMESTAMP",
                params![hostname, config, health],
            )?;
            Ok(())
        })
        .await
    }

    async fn put_health(&self, hostname: &str, health: &[HealthRecord]) -> Result<bool> {
        let hostname = hostname.to_string();
        let health = serde_json::to_string(health)?;
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE domains SET health = ?2 WHERE hostname = ?1",
                params![hostname, health],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn delete(&self, hostname: &str) -> Result<()> {
        let hostname = hostname.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM domains WHERE hostname = ?1", params![hostname])?;
            Ok(())
        })
        .await
    }

    async fn publish(&self, hostname: &str) -> Result<()> {
        let hostname = hostname.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO config_updates (hostname) VALUES (?1)",
                params![hostname],
            )?;
            // AUTOINCREMENT keeps MAX(id) monotonic after pruning
            conn.execute(
                "DELETE FROM config_updates
                 WHERE id <= (SELECT MAX(id) FROM config_updates) - ?1",
                params![CHANGE_LOG_LIMIT],
            )?;
            Ok(())
        })
        .await
    }

    async fn latest_change(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let id: Option<i64> = conn
                .query_row("SELECT MAX(id) FROM config_updates", [], |row| {
                    row.get::<_, Option<i64>>(0)
                })
                .optional()?
                .flatten();
            Ok(id.unwrap_or(0))
        })
        .await
    }
}
