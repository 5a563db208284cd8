//! Client-facing protections around the edge pipeline
//! IP lists with CIDR support, per-client fixed-window rate limiting, and the
//! security headers added to every tenant response.

use dashmap::DashMap;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, VARY,
};
use ipnet::IpNet;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::domain::CorsPolicy;

/// Set of exact addresses and CIDR ranges
#[derive(Debug, Clone, Default)]
pub struct IpList {
    addrs: Vec<IpAddr>,
    nets: Vec<IpNet>,
}

impl IpList {
    /// Unparseable entries are logged and skipped
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut list = IpList::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry.contains('/') {
                match entry.parse::<IpNet>() {
                    Ok(net) => list.nets.push(net),
                    Err(e) => warn!(entry = %entry, error = %e, "Ignoring invalid CIDR range"),
                }
            } else {
                match entry.parse::<IpAddr>() {
                    Ok(addr) => list.addrs.push(addr),
                    Err(e) => warn!(entry = %entry, error = %e, "Ignoring invalid IP address"),
                }
            }
        }
        list
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty() && self.nets.is_empty()
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = canonical_ip(ip);
        self.addrs.iter().any(|a| canonical_ip(a) == ip) || self.nets.iter().any(|n| n.contains(&ip))
    }
}

/// IPv4-mapped IPv6 addresses compare as their IPv4 form
pub fn canonical_ip(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(*v6)),
        v4 => *v4,
    }
}

/// Admin routes accept everyone when the whitelist is empty
pub fn admin_allowed(whitelist: &IpList, ip: &IpAddr) -> bool {
    whitelist.is_empty() || whitelist.contains(ip)
}

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter keyed by client IP
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    clients: DashMap<IpAddr, Window>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: config.window,
            max_requests: config.max_requests,
            clients: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_requests > 0
    }

    /// Count one request; false once the client is over its limit
    pub fn check(&self, ip: IpAddr) -> bool {
        if !self.enabled() {
            return true;
        }

        let now = Instant::now();
        let mut window = self.clients.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }

        window.count += 1;
        if window.count > self.max_requests {
            debug!(ip = %ip, count = window.count, "Rate limit exceeded");
            return false;
        }
        true
    }

    /// Drop windows that have already elapsed
    pub fn cleanup(&self) -> usize {
        let before = self.clients.len();
        let window = self.window;
        self.clients.retain(|_, w| w.started.elapsed() < window);
        before - self.clients.len()
    }
}

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-frame-options", "SAMEORIGIN"),
    ("x-xss-protection", "1; mode=block"),
    ("x-content-type-options", "nosniff"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("permissions-policy", "geolocation=(), microphone=(), camera=()"),
    (
        "strict-transport-security",
        "max-age=31536000; includeSubDomains; preload",
    ),
];

/// Add the standard security headers, leaving any the origin already set
pub fn apply_security_headers(headers: &mut HeaderMap) {
    for (name, value) in SECURITY_HEADERS {
        let name = HeaderName::from_static(name);
        if !headers.contains_key(&name) {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }
}

/// Tenant CORS headers. The tenant's edge policy replaces whatever the
/// origin sent for these headers.
pub fn apply_cors_headers(headers: &mut HeaderMap, policy: &CorsPolicy, request_origin: Option<&str>) {
    if policy.allows_origin(request_origin) {
        let allowed = request_origin.unwrap_or("*");
        if let Ok(value) = HeaderValue::from_str(allowed) {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        if request_origin.is_some() {
            headers.append(VARY, HeaderValue::from_static("Origin"));
        }
    }

    if let Ok(value) = HeaderValue::from_str(&policy.allowed_methods) {
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, value);
    }
    if let Ok(value) = HeaderValue::from_str(&policy.allowed_headers) {
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, value);
    }
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(policy.max_age));
    if policy.allow_credentials {
        headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    }
}
