//! Request filtering
//!
//! Order, first match wins:
//! 1. threat-intelligence IPs
//! 2. static attack signatures (SQL injection, XSS, path traversal, VCS paths)
//! 3. the tenant's own active rules, case-insensitive
//! 4. the tenant's blocked IPs and ranges

use dashmap::DashMap;
use hyper::http::request::Parts;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::net::IpAddr;
use tracing::warn;

use crate::domain::DomainEntry;
use crate::security::IpList;

/// Read-only view of an inbound request, shared by the filter and edge scripts
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    /// Path plus query exactly as received
    pub target: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub client_ip: IpAddr,
}

impl RequestInfo {
    pub fn from_parts(parts: &Parts, client_ip: IpAddr) -> Self {
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let headers = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            method: parts.method.as_str().to_string(),
            target,
            path: parts.uri.path().to_string(),
            headers,
            client_ip,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn decoded_target(&self) -> String {
        percent_decode_str(&self.target).decode_utf8_lossy().to_string()
    }
}

/// Filtering outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WafVerdict {
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WafVerdict {
    pub fn pass() -> Self {
        Self {
            blocked: false,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
        }
    }
}

static SQL_INJECTION: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\b(select|insert|update|delete|drop|union)\b").unwrap(),
        Regex::new(r"'|--").unwrap(),
        Regex::new(r"(?i)\b(or|and)\s+\d+\s*=\s*\d+").unwrap(),
    ]
});

static XSS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)<\s*script").unwrap(),
        Regex::new(r"(?i)javascript\s*:").unwrap(),
        Regex::new(r"(?i)\bon\w+\s*=").unwrap(),
    ]
});

static PATH_TRAVERSAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.\./|\.\.\\").unwrap());

static VCS_EXPOSURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)/\.(git|svn|hg)(/|\?|$)").unwrap());

/// Upper bound on distinct tenant patterns kept compiled
const PATTERN_CACHE_LIMIT: usize = 10_000;

pub struct Waf {
    threat_ips: IpList,
    /// Compiled tenant patterns; `None` marks a pattern that failed to compile
    compiled: DashMap<String, Option<Regex>>,
}

impl Waf {
    pub fn new(threat_ips: IpList) -> Self {
        Self {
            threat_ips,
            compiled: DashMap::new(),
        }
    }

    pub fn evaluate(&self, req: &RequestInfo, config: Option<&DomainEntry>) -> WafVerdict {
        if self.threat_ips.contains(&req.client_ip) {
            return WafVerdict::block("Malicious IP (Threat Intelligence)");
        }

        let decoded = req.decoded_target();
        let candidates = [decoded.as_str(), req.target.as_str()];

        if let Some(reason) = static_match(&candidates) {
            return WafVerdict::block(reason);
        }

        let Some(config) = config else {
            return WafVerdict::pass();
        };

        for rule in config.waf_rules.iter().filter(|r| r.active) {
            if let Some(regex) = self.tenant_pattern(&rule.pattern) {
                if regex.is_match(&decoded) {
                    let reason = rule
                        .name
                        .clone()
                        .unwrap_or_else(|| "Custom WAF Rule".to_string());
                    return WafVerdict::block(reason);
                }
            }
        }

        if !config.blocked_ips.is_empty() {
            let blocked = IpList::parse(&config.blocked_ips);
            if blocked.contains(&req.client_ip) {
                return WafVerdict::block("IP explicitly blocked for this domain");
            }
        }

        WafVerdict::pass()
    }

    fn tenant_pattern(&self, pattern: &str) -> Option<Regex> {
        if let Some(cached) = self.compiled.get(pattern) {
            return cached.clone();
        }

        let compiled = match RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(1 << 20)
            .build()
        {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Skipping invalid tenant WAF pattern");
                None
            }
        };

        if self.compiled.len() >= PATTERN_CACHE_LIMIT {
            self.compiled.clear();
        }
        self.compiled.insert(pattern.to_string(), compiled.clone());
        compiled
    }
}

fn static_match(candidates: &[&str]) -> Option<&'static str> {
    for target in candidates {
        if SQL_INJECTION.iter().any(|r| r.is_match(target)) {
            return Some("SQL Injection Attempt");
        }
        if XSS.iter().any(|r| r.is_match(target)) {
            return Some("XSS Attempt");
        }
        if PATH_TRAVERSAL.is_match(target) {
            return Some("Path Traversal");
        }
        if VCS_EXPOSURE.is_match(target) {
            return Some("Git Access Denied");
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OriginSet, UpsertOptions, WafRule};

    fn request(target: &str, ip: &str) -> RequestInfo {
        RequestInfo {
            method: "GET".to_string(),
            target: target.to_string(),
            path: target.split('?').next().unwrap_or("/").to_string(),
            headers: vec![("host".to_string(), "shop.example".to_string())],
            client_ip: ip.parse().unwrap(),
        }
    }

    fn tenant(rules: Vec<WafRule>, blocked: Vec<&str>) -> DomainEntry {
        DomainEntry::new(
            "shop.example",
            OriginSet::from("http://origin.internal"),
            UpsertOptions {
                waf_rules: rules,
                blocked_ips: blocked.into_iter().map(String::from).collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_static_signatures_block() {
        let waf = Waf::new(IpList::default());
        for target in [
            "/?id=1%20OR%201=1",
            "/?id=1 OR 1=1",
            "/search?q=%3Cscript%3Ealert(1)%3C/script%3E",
            "/../../etc/passwd",
            "/.git/config",
            "/?q=1'--",
        ] {
            let verdict = waf.evaluate(&request(target, "10.0.0.1"), None);
            assert!(verdict.blocked, "expected {} to be blocked", target);
        }
    }

    #[test]
    fn test_clean_requests_pass() {
        let waf = Waf::new(IpList::default());
        for target in ["/", "/static/app.css", "/products?page=2&content=shoes", "/.github-pages"] {
            assert_eq!(
                waf.evaluate(&request(target, "10.0.0.1"), None),
                WafVerdict::pass(),
                "{}",
                target
            );
        }
    }

    #[test]
    fn test_threat_ip_checked_first() {
        let waf = Waf::new(IpList::parse(&["1.2.3.4"]));
        let verdict = waf.evaluate(&request("/", "1.2.3.4"), None);
        assert_eq!(verdict.reason.as_deref(), Some("Malicious IP (Threat Intelligence)"));
    }

    #[test]
    fn test_custom_rules_case_insensitive_and_named() {
        let waf = Waf::new(IpList::default());
        let config = tenant(
            vec![WafRule {
                pattern: "^/wp-admin".to_string(),
                name: Some("No WordPress".to_string()),
                active: true,
            }],
            vec![],
        );

        let verdict = waf.evaluate(&request("/WP-Admin/login.php", "10.0.0.1"), Some(&config));
        assert_eq!(verdict, WafVerdict::block("No WordPress"));
    }

    #[test]
    fn test_inactive_and_invalid_rules_are_skipped() {
        let waf = Waf::new(IpList::default());
        let config = tenant(
            vec![
                WafRule {
                    pattern: "^/admin".to_string(),
                    name: None,
                    active: false,
                },
                WafRule {
                    pattern: "(unclosed".to_string(),
                    name: None,
                    active: true,
                },
            ],
            vec![],
        );

        assert!(!waf.evaluate(&request("/admin", "10.0.0.1"), Some(&config)).blocked);
    }

    #[test]
    fn test_unnamed_rule_reason() {
        let waf = Waf::new(IpList::default());
        let config = tenant(
            vec![WafRule {
                pattern: "secret".to_string(),
                name: None,
                active: true,
            }],
            vec![],
        );
        let verdict = waf.evaluate(&request("/Secret/file", "10.0.0.1"), Some(&config));
        assert_eq!(verdict.reason.as_deref(), Some("Custom WAF Rule"));
    }

    #[test]
    fn test_tenant_blocked_ips_and_ranges() {
        let waf = Waf::new(IpList::default());
        let config = tenant(vec![], vec!["10.9.9.9", "172.16.0.0/12"]);

        assert!(waf.evaluate(&request("/", "10.9.9.9"), Some(&config)).blocked);
        assert!(waf.evaluate(&request("/", "172.20.1.1"), Some(&config)).blocked);
        assert!(!waf.evaluate(&request("/", "10.9.9.8"), Some(&config)).blocked);
    }
}
