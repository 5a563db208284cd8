//! Request analytics
//!
//! Counters are kept in memory and written to the snapshot file on a timer and
//! at shutdown, never per request.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::persist::write_atomic;

pub const HISTORY_LIMIT: usize = 60;

/// How one edge request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Hit,
    Miss,
    /// Forwarded without a cache lookup (non-GET, authorized, script response)
    Bypass,
    Blocked,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Hit => "HIT",
            Outcome::Miss => "MISS",
            Outcome::Bypass => "BYPASS",
            Outcome::Blocked => "BLOCKED",
            Outcome::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub misses: u64,
    #[serde(default)]
    pub blocked: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub bandwidth: u64,
}

impl Counters {
    fn record(&mut self, outcome: Outcome, bytes: u64) {
        self.total_requests += 1;
        match outcome {
            Outcome::Hit => self.hits += 1,
            Outcome::Miss => self.misses += 1,
            Outcome::Blocked => self.blocked += 1,
            Outcome::Error => self.errors += 1,
            Outcome::Bypass => {}
        }
        self.bandwidth += bytes;
    }
}

/// Counters for one wall-clock minute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinuteBucket {
    pub minute: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: Counters,
}

/// Contents of the analytics snapshot file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    #[serde(flatten)]
    pub totals: Counters,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: VecDeque<MinuteBucket>,
    #[serde(default)]
    pub domains: BTreeMap<String, Counters>,
}

impl AnalyticsSnapshot {
    fn record_at(&mut self, now: DateTime<Utc>, hostname: &str, outcome: Outcome, bytes: u64) {
        self.totals.record(outcome, bytes);
        self.domains
            .entry(hostname.to_string())
            .or_default()
            .record(outcome, bytes);

        let minute = now
            .duration_trunc(TimeDelta::minutes(1))
            .unwrap_or(now);
        match self.history.back_mut() {
            Some(bucket) if bucket.minute == minute => bucket.counters.record(outcome, bytes),
            _ => {
                let mut counters = Counters::default();
                counters.record(outcome, bytes);
                self.history.push_back(MinuteBucket { minute, counters });
                while self.history.len() > HISTORY_LIMIT {
                    self.history.pop_front();
                }
            }
        }
        self.last_update = Some(now);
    }
}

pub struct Analytics {
    path: PathBuf,
    state: Mutex<AnalyticsSnapshot>,
    dirty: AtomicBool,
}

impl Analytics {
    /// Load the snapshot at `path`. A missing or unreadable file starts from zero.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<AnalyticsSnapshot>(&raw) {
                Ok(mut snapshot) => {
                    while snapshot.history.len() > HISTORY_LIMIT {
                        snapshot.history.pop_front();
                    }
                    info!(path = %path.display(), total = snapshot.totals.total_requests, "Loaded analytics");
                    snapshot
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse analytics, starting fresh");
                    AnalyticsSnapshot::default()
                }
            },
            Err(_) => AnalyticsSnapshot::default(),
        };

        Self {
            path,
            state: Mutex::new(state),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn record(&self, hostname: &str, outcome: Outcome, bytes: u64) {
        self.state.lock().record_at(Utc::now(), hostname, outcome, bytes);
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        self.state.lock().clone()
    }

    /// Write the snapshot if anything changed since the last flush
    pub fn flush(&self) -> std::io::Result<bool> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(false);
        }
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        if let Err(e) = write_atomic(&self.path, &json) {
            self.dirty.store(true, Ordering::Relaxed);
            return Err(e);
        }
        debug!(path = %self.path.display(), "Analytics flushed");
        Ok(true)
    }

    pub async fn run_flush(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush() {
                        warn!(error = %e, "Failed to flush analytics");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}
