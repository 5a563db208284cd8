//! Tenant domain configuration types
//! Shared by the registry, the shared store, the admin API and the snapshot file

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EdgeError, Result};

/// One or more origin URLs. Serialized as a bare string when there is only one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OriginSet {
    Single(String),
    Multiple(Vec<String>),
}

impl OriginSet {
    pub fn as_slice(&self) -> &[String] {
        match self {
            OriginSet::Single(origin) => std::slice::from_ref(origin),
            OriginSet::Multiple(origins) => origins,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().iter().all(|o| o.trim().is_empty())
    }

    pub fn first(&self) -> Option<&str> {
        self.as_slice().first().map(|s| s.as_str())
    }

    /// Reject empty sets and anything that is not an absolute http(s) URL
    pub fn validate(&self) -> Result<()> {
        if self.as_slice().is_empty() || self.is_empty() {
            return Err(EdgeError::InvalidConfig("origin set is empty".to_string()));
        }
        for origin in self.as_slice() {
            let url = url::Url::parse(origin)
                .map_err(|e| EdgeError::InvalidConfig(format!("invalid origin {}: {}", origin, e)))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(EdgeError::InvalidConfig(format!(
                    "origin {} must use http or https",
                    origin
                )));
            }
            if url.host_str().is_none() {
                return Err(EdgeError::InvalidConfig(format!("origin {} has no host", origin)));
            }
        }
        Ok(())
    }
}

impl From<&str> for OriginSet {
    fn from(origin: &str) -> Self {
        OriginSet::Single(origin.to_string())
    }
}

impl From<Vec<String>> for OriginSet {
    fn from(origins: Vec<String>) -> Self {
        if origins.len() == 1 {
            OriginSet::Single(origins.into_iter().next().unwrap_or_default())
        } else {
            OriginSet::Multiple(origins)
        }
    }
}

/// Latest probe result for one origin. Replaced wholesale every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub origin: String,
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tenant-defined filtering pattern. Inactive rules stay in the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WafRule {
    pub pattern: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// When an edge script runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgePhase {
    #[default]
    Request,
    Response,
}

/// Tenant-supplied edge script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRule {
    #[serde(default)]
    pub id: String,
    pub script: String,
    #[serde(default)]
    pub phase: EdgePhase,
}

/// Cross-origin policy answered at the edge for one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsPolicy {
    /// `*` allows any origin
    #[serde(default = "default_cors_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_cors_methods")]
    pub allowed_methods: String,
    #[serde(default = "default_cors_headers")]
    pub allowed_headers: String,
    /// Preflight cache lifetime, in seconds
    #[serde(default = "default_cors_max_age")]
    pub max_age: u64,
    #[serde(default)]
    pub allow_credentials: bool,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            allowed_origins: default_cors_origins(),
            allowed_methods: default_cors_methods(),
            allowed_headers: default_cors_headers(),
            max_age: default_cors_max_age(),
            allow_credentials: false,
        }
    }
}

impl CorsPolicy {
    pub fn allows_origin(&self, origin: Option<&str>) -> bool {
        self.allowed_origins.iter().any(|allowed| {
            allowed == "*" || origin.map(|o| o.eq_ignore_ascii_case(allowed)).unwrap_or(false)
        })
    }
}

/// One tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEntry {
    pub hostname: String,
    pub origin: OriginSet,
    #[serde(default = "default_plan")]
    pub plan: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub waf_rules: Vec<WafRule>,
    #[serde(default)]
    pub edge_rules: Vec<EdgeRule>,
    #[serde(default, rename = "blockedIPs")]
    pub blocked_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<Vec<HealthRecord>>,
    /// Overrides the node-wide default TTL, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<u64>,
    /// Absent means CORS is left to the origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsPolicy>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl DomainEntry {
    pub fn new(hostname: &str, origin: OriginSet, options: UpsertOptions) -> Self {
        Self {
            hostname: hostname.to_string(),
            origin,
            plan: options.plan.unwrap_or_else(default_plan),
            active: options.active.unwrap_or(true),
            waf_rules: options.waf_rules,
            edge_rules: options.edge_rules,
            blocked_ips: options.blocked_ips,
            health: None,
            cache_ttl: options.cache_ttl,
            cors: options.cors,
            created_at: Utc::now(),
        }
    }

    /// Origin selection: the first origin whose latest probe was healthy,
    /// otherwise the first configured origin. Inactive entries yield nothing.
    pub fn select_origin(&self) -> Option<&str> {
        if !self.active {
            return None;
        }
        let origins = self.origin.as_slice();
        if let Some(health) = self.health.as_ref().filter(|h| h.len() == origins.len()) {
            if let Some((origin, _)) = origins
                .iter()
                .zip(health.iter())
                .find(|(_, record)| record.healthy)
            {
                return Some(origin.as_str());
            }
        }
        self.origin.first()
    }

    /// True when `records` describe exactly this entry's origins, in order
    pub fn health_matches(&self, records: &[HealthRecord]) -> bool {
        let origins = self.origin.as_slice();
        records.len() == origins.len()
            && origins
                .iter()
                .zip(records)
                .all(|(origin, record)| *origin == record.origin)
    }

    pub fn edge_rule(&self, phase: EdgePhase) -> Option<&EdgeRule> {
        self.edge_rules.iter().find(|rule| rule.phase == phase)
    }
}

/// Optional fields accepted by `upsert`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOptions {
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub waf_rules: Vec<WafRule>,
    #[serde(default)]
    pub edge_rules: Vec<EdgeRule>,
    #[serde(default, rename = "blockedIPs")]
    pub blocked_ips: Vec<String>,
    #[serde(default)]
    pub cache_ttl: Option<u64>,
    #[serde(default)]
    pub cors: Option<CorsPolicy>,
}

/// Snapshot values may be a bare origin string from older deployments
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum StoredEntry {
    Full(DomainEntry),
    Legacy(String),
}

impl StoredEntry {
    pub(crate) fn into_entry(self, hostname: &str) -> DomainEntry {
        match self {
            StoredEntry::Full(entry) => entry,
            StoredEntry::Legacy(origin) => {
                DomainEntry::new(hostname, OriginSet::Single(origin), UpsertOptions::default())
            }
        }
    }
}

/// Lowercase and strip any port from a Host header value
pub fn normalize_hostname(host: &str) -> String {
    let host = host.trim();
    let host = if host.starts_with('[') {
        // IPv6 literal, keep the brackets and drop the port
        host.split(']').next().map(|h| format!("{}]", h)).unwrap_or_default()
    } else {
        host.split(':').next().unwrap_or(host).to_string()
    };
    host.trim_end_matches('.').to_lowercase()
}

fn default_plan() -> String {
    "free".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_cors_methods() -> String {
    "GET, POST, PUT, DELETE, OPTIONS".to_string()
}

fn default_cors_headers() -> String {
    "Content-Type, Authorization, X-Requested-With".to_string()
}

fn default_cors_max_age() -> u64 {
    86400
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(origin: &str, healthy: bool) -> HealthRecord {
        HealthRecord {
            origin: origin.to_string(),
            healthy,
            last_checked: Utc::now(),
            error: None,
        }
    }

    #[test]
    fn test_origin_set_serde_shapes() {
        let single: OriginSet = serde_json::from_str("\"http://a.internal\"").unwrap();
        assert_eq!(single.as_slice(), &["http://a.internal".to_string()]);

        let multi: OriginSet =
            serde_json::from_str("[\"http://a.internal\",\"http://b.internal\"]").unwrap();
        assert_eq!(multi.len(), 2);
    }

    #[test]
    fn test_origin_validation() {
        assert!(OriginSet::from("http://origin.example").validate().is_ok());
        assert!(OriginSet::Multiple(vec![]).validate().is_err());
        assert!(OriginSet::from("ftp://origin.example").validate().is_err());
        assert!(OriginSet::from("not a url").validate().is_err());
    }

    #[test]
    fn test_select_origin_prefers_healthy() {
        let mut entry = DomainEntry::new(
            "shop.example",
            OriginSet::Multiple(vec!["http://a".into(), "http://b".into()]),
            UpsertOptions::default(),
        );
        entry.health = Some(vec![record("http://a", false), record("http://b", true)]);
        assert_eq!(entry.select_origin(), Some("http://b"));
    }

    #[test]
    fn test_select_origin_fails_open() {
        let mut entry = DomainEntry::new(
            "shop.example",
            OriginSet::Multiple(vec!["http://a".into(), "http://b".into()]),
            UpsertOptions::default(),
        );
        entry.health = Some(vec![record("http://a", false), record("http://b", false)]);
        assert_eq!(entry.select_origin(), Some("http://a"));
    }

    #[test]
    fn test_health_matches_origin_order() {
        let entry = DomainEntry::new(
            "shop.example",
            OriginSet::Multiple(vec!["http://a".into(), "http://b".into()]),
            UpsertOptions::default(),
        );
        assert!(entry.health_matches(&[record("http://a", true), record("http://b", false)]));
        assert!(!entry.health_matches(&[record("http://b", true), record("http://a", false)]));
        assert!(!entry.health_matches(&[record("http://a", true)]));
    }

    #[test]
    fn test_inactive_entry_has_no_origin() {
        let entry = DomainEntry::new(
            "shop.example",
            OriginSet::from("http://a"),
            UpsertOptions {
                active: Some(false),
                ..Default::default()
            },
        );
        assert_eq!(entry.select_origin(), None);
    }

    #[test]
    fn test_legacy_string_entry() {
        let stored: StoredEntry = serde_json::from_str("\"http://legacy.internal\"").unwrap();
        let entry = stored.into_entry("old.example");
        assert_eq!(entry.hostname, "old.example");
        assert_eq!(entry.plan, "free");
        assert!(entry.active);
    }

    #[test]
    fn test_entry_json_field_names() {
        let json = r#"{
            "hostname": "a.example",
            "origin": "http://o.internal",
            "wafRules": [{"pattern": "^/wp-admin", "name": "No WP"}],
            "blockedIPs": ["10.0.0.9"]
        }"#;
        let entry: DomainEntry = serde_json::from_str(json).unwrap();
        assert!(entry.active);
        assert!(entry.waf_rules[0].active);
        assert_eq!(entry.blocked_ips, vec!["10.0.0.9".to_string()]);
    }

    #[test]
    fn test_cors_policy_defaults_and_origin_match() {
        let json = r#"{
            "hostname": "api.example",
            "origin": "http://o.internal",
            "cors": {"allowedOrigins": ["https://app.example"], "allowCredentials": true}
        }"#;
        let entry: DomainEntry = serde_json::from_str(json).unwrap();
        let cors = entry.cors.unwrap();
        assert_eq!(cors.max_age, 86400);
        assert_eq!(cors.allowed_methods, "GET, POST, PUT, DELETE, OPTIONS");
        assert!(cors.allows_origin(Some("https://app.example")));
        assert!(!cors.allows_origin(Some("https://evil.example")));
        assert!(!cors.allows_origin(None));
        assert!(CorsPolicy::default().allows_origin(None));
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("Shop.Example:8080"), "shop.example");
        assert_eq!(normalize_hostname("shop.example."), "shop.example");
        assert_eq!(normalize_hostname("[::1]:443"), "[::1]");
    }
}
