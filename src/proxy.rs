//! Edge server implementation
//! Plain HTTP and SNI-routed HTTPS listeners feeding one request pipeline:
//! resolve, filter, script, cache, forward.

use crate::analytics::{Analytics, Outcome};
use crate::cache::{cache_ttl, CacheKey, CachedResponse, ResponseCache};
use crate::certificate::CertificateManager;
use crate::config::EdgeConfig;
use crate::domain::{normalize_hostname, DomainEntry, EdgePhase};
use crate::edge::{EdgeEngine, ResponseView, ScriptOutcome};
use crate::error::EdgeError;
use crate::registry::DomainRegistry;
use crate::security::{apply_cors_headers, apply_security_headers, canonical_ip, IpList, RateLimiter};
use crate::shutdown::Shutdown;
use crate::tls::TlsResolver;
use crate::waf::{RequestInfo, Waf};
use crate::websocket::{is_websocket_upgrade, WebSocketProxy};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

const ORIGIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Headers that describe one hop and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Edge server
pub struct EdgeServer {
    pub(crate) config: EdgeConfig,
    pub(crate) registry: Arc<DomainRegistry>,
    pub(crate) certificates: Arc<CertificateManager>,
    pub(crate) tls: Arc<TlsResolver>,
    pub(crate) waf: Arc<Waf>,
    pub(crate) edge: EdgeEngine,
    pub(crate) cache: Arc<ResponseCache>,
    pub(crate) websockets: Arc<WebSocketProxy>,
    pub(crate) analytics: Arc<Analytics>,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) admin_whitelist: IpList,
    metrics: Option<PrometheusHandle>,
    client: reqwest::Client,
    connections: Arc<AtomicUsize>,
}

/// Counts a connection as in flight until dropped
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EdgeServer {
    /// Create a new edge server
    pub fn new(
        config: EdgeConfig,
        registry: Arc<DomainRegistry>,
        certificates: Arc<CertificateManager>,
        analytics: Arc<Analytics>,
    ) -> Result<Self> {
        let waf = Arc::new(Waf::new(IpList::parse(&config.threat_ips)));
        let tls = Arc::new(TlsResolver::new(certificates.clone(), registry.clone()));
        let websockets = Arc::new(WebSocketProxy::new(registry.clone(), waf.clone()));
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(ORIGIN_TIMEOUT)
            .build()?;

        Ok(Self {
            cache: Arc::new(ResponseCache::new(&config.cache)),
            rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            admin_whitelist: IpList::parse(&config.admin_whitelist),
            edge: EdgeEngine::default(),
            metrics: None,
            connections: Arc::new(AtomicUsize::new(0)),
            config,
            registry,
            certificates,
            tls,
            waf,
            websockets,
            analytics,
            client,
        })
    }

    /// Serve `GET /metrics` from this recorder
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn websockets(&self) -> &Arc<WebSocketProxy> {
        &self.websockets
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn analytics(&self) -> &Arc<Analytics> {
        &self.analytics
    }

    pub fn tls(&self) -> &Arc<TlsResolver> {
        &self.tls
    }

    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Bind the listeners and accept until `shutdown` fires. Connections
    /// already accepted finish on their own tasks.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> Result<()> {
        let http_addr: SocketAddr = format!("0.0.0.0:{}", self.config.http_port).parse()?;
        let http_listener = TcpListener::bind(http_addr).await?;
        info!("HTTP server listening on {}", http_addr);

        let mut loops = Vec::new();

        if self.config.enable_https {
            let https_addr: SocketAddr = format!("0.0.0.0:{}", self.config.https_port).parse()?;
            let https_listener = TcpListener::bind(https_addr).await?;
            info!("HTTPS server listening on {}", https_addr);
            loops.push(tokio::spawn(
                self.clone()
                    .accept_loop(https_listener, true, shutdown.clone()),
            ));
        }

        loops.push(tokio::spawn(
            self.clone().accept_loop(http_listener, false, shutdown),
        ));

        for handle in loops {
            handle.await.map_err(|e| anyhow!("listener task failed: {}", e))?;
        }
        Ok(())
    }

    /// Wait for in-flight connections to finish, up to `grace`
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while self.active_connections() > 0 {
            if Instant::now() >= deadline {
                warn!(remaining = self.active_connections(), "Drain grace period elapsed");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, tls: bool, shutdown: Shutdown) {
        let mut stop = shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let server = self.clone();
                    let conn_shutdown = shutdown.subscribe();
                    let guard = ConnectionGuard::new(&self.connections);
                    tokio::spawn(async move {
                        let _guard = guard;
                        let result = if tls {
                            server.handle_tls_connection(stream, remote_addr, conn_shutdown).await
                        } else {
                            server.serve(TokioIo::new(stream), remote_addr, false, conn_shutdown).await
                        };
                        if let Err(e) = result {
                            debug!("Connection error from {}: {}", remote_addr, e);
                        }
                    });
                }
                _ = stop.recv() => {
                    info!(tls, "Listener stopped accepting connections");
                    break;
                }
            }
        }
    }

    /// Read the ClientHello, pick the context for its SNI, then serve
    async fn handle_tls_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = acceptor.await?;
        let sni = start.client_hello().server_name().map(|s| s.to_string());

        let config = match self.tls.context_for(sni.as_deref()).await {
            Ok(config) => config,
            Err(e) => {
                warn!(sni = ?sni, client = %remote_addr, error = %e, "TLS handshake aborted");
                return Ok(());
            }
        };

        let tls_stream = start.into_stream(config).await?;
        self.serve(TokioIo::new(tls_stream), remote_addr, true, shutdown)
            .await
    }

    /// Handle a single HTTP connection
    async fn serve<I>(
        self: Arc<Self>,
        io: I,
        remote_addr: SocketAddr,
        is_tls: bool,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()>
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let server = self.clone();
        let service = service_fn(move |req| {
            let server = server.clone();
            async move { server.handle_request(req, remote_addr, is_tls).await }
        });

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(io, service)
            .with_upgrades();
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown.recv() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        result.map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        is_tls: bool,
    ) -> Result<Response<ResponseBody>, Infallible> {
        let path = req.uri().path().to_string();
        let client_ip = canonical_ip(&remote_addr.ip());

        debug!("{} {} from {}", req.method(), path, remote_addr);

        // Health check endpoint
        if path == "/health" {
            return Ok(text_response(StatusCode::OK, "OK"));
        }

        if path == "/metrics" {
            if let Some(handle) = &self.metrics {
                return Ok(text_response(StatusCode::OK, &handle.render()));
            }
        }

        // ACME challenge endpoint
        if let Some(token) = path.strip_prefix("/.well-known/acme-challenge/") {
            return Ok(match self.certificates.get_acme_challenge(token) {
                Some(key_auth) => text_response(StatusCode::OK, &key_auth),
                None => error_response(StatusCode::NOT_FOUND, "Challenge not found"),
            });
        }

        let host = match request_host(&req) {
            Some(host) => host,
            None => return Ok(error_response(StatusCode::BAD_REQUEST, "Missing Host header")),
        };

        // Force HTTPS redirect
        if self.config.force_https && !is_tls && !is_https_request(&req) {
            let location = format!(
                "https://{}{}",
                host,
                req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
            );
            return Ok(redirect_response(&location, StatusCode::MOVED_PERMANENTLY));
        }

        if path.starts_with("/admin/") || path == "/cdn-purge" {
            return Ok(crate::admin::handle(&self, req, client_ip).await);
        }

        if self.config.websocket_enabled && is_websocket_upgrade(&req) {
            return Ok(self.websockets.accept(req, &host, client_ip).await);
        }

        let forwarded_tls = is_tls || is_https_request(&req);
        Ok(self.serve_edge(req, host, client_ip, forwarded_tls).await)
    }

    /// Tenant request pipeline
    async fn serve_edge(
        &self,
        req: Request<Incoming>,
        host: String,
        client_ip: IpAddr,
        is_https: bool,
    ) -> Response<ResponseBody> {
        let origin = match self.registry.resolve_origin(&host) {
            Some(origin) => origin,
            None => {
                let err = EdgeError::DomainNotConfigured(host.clone());
                debug!(hostname = %host, "Domain not configured");
                return error_response(err.status(), &err.public_message());
            }
        };
        let config = self.registry.get_config(&host);

        if !self.rate_limiter.check(client_ip) {
            let err = EdgeError::RateLimited(client_ip.to_string());
            warn!(hostname = %host, ip = %client_ip, "Rate limit exceeded");
            return error_response(err.status(), &err.public_message());
        }

        let (parts, body) = req.into_parts();
        let info = RequestInfo::from_parts(&parts, client_ip);

        let verdict = self.waf.evaluate(&info, config.as_deref());
        if verdict.blocked {
            let reason = verdict.reason.unwrap_or_else(|| "blocked".to_string());
            warn!(
                event = "BLOCKED",
                hostname = %host,
                ip = %client_ip,
                target = %info.target,
                reason = %reason,
                "Request blocked"
            );
            self.analytics.record(&host, Outcome::Blocked, 0);
            crate::metrics::record_block(&reason);
            let err = EdgeError::Blocked(reason);
            return error_response(err.status(), &err.public_message());
        }

        // Preflight for a tenant with an edge CORS policy never reaches the origin
        if parts.method == Method::OPTIONS {
            if let Some(cors) = config.as_deref().and_then(|c| c.cors.as_ref()) {
                let mut response = Response::new(empty_body());
                *response.status_mut() = StatusCode::NO_CONTENT;
                apply_cors_headers(response.headers_mut(), cors, info.header("origin"));
                apply_security_headers(response.headers_mut());
                self.analytics.record(&host, Outcome::Bypass, 0);
                crate::metrics::record_request(&host, Outcome::Bypass.as_str());
                return response;
            }
        }

        let mut script_headers = Vec::new();
        if let Some(rule) = config.as_deref().and_then(|c| c.edge_rule(EdgePhase::Request)) {
            let outcome = self.edge.execute(&host, rule, &info, None).await;
            if let Some(response) = script_response(&outcome) {
                let mut response = response;
                apply_script_headers(response.headers_mut(), &outcome.response_headers);
                apply_security_headers(response.headers_mut());
                self.analytics.record(&host, Outcome::Bypass, 0);
                crate::metrics::record_request(&host, Outcome::Bypass.as_str());
                return response;
            }
            script_headers = outcome.response_headers;
        }

        let lookup = (parts.method == Method::GET || parts.method == Method::HEAD)
            && !parts.headers.contains_key(hyper::header::AUTHORIZATION);
        let key = CacheKey::new(&host, parts.uri.path(), parts.uri.query(), &parts.headers);

        if lookup {
            if let Some(hit) = self.cache.get(&key) {
                info!(event = "HIT", hostname = %host, key = %key.as_string(), "Cache hit");
                return self
                    .finish(&host, config.as_deref(), &info, hit, Outcome::Hit, script_headers)
                    .await;
            }
        }

        let body_bytes = match body.collect().await {
            Ok(b) => b.to_bytes(),
            Err(e) => {
                error!("Failed to read request body: {}", e);
                return error_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        let target_url = format!("{}{}", origin.trim_end_matches('/'), info.target);
        let started = Instant::now();
        let upstream = match self
            .forward(&parts.method, &target_url, &parts.headers, body_bytes, client_ip, &host, is_https)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(event = "ERROR", hostname = %host, origin = %origin, error = %e, "Origin request failed");
                self.analytics.record(&host, Outcome::Error, 0);
                return error_response(e.status(), &e.public_message());
            }
        };
        crate::metrics::record_origin_latency(started.elapsed().as_secs_f64());

        let outcome = if lookup { Outcome::Miss } else { Outcome::Bypass };
        if lookup {
            let default_ttl = config
                .as_deref()
                .and_then(|c| c.cache_ttl)
                .map(Duration::from_secs)
                .unwrap_or_else(|| self.cache.default_ttl());
            if let Some(ttl) = cache_ttl(
                &parts.method,
                &parts.headers,
                upstream.status,
                &upstream.headers,
                default_ttl,
            ) {
                self.cache.put(&key, upstream.clone(), ttl);
            }
            info!(event = "MISS", hostname = %host, key = %key.as_string(), status = upstream.status.as_u16(), "Cache miss");
        }

        self.finish(&host, config.as_deref(), &info, upstream, outcome, script_headers)
            .await
    }

    /// Send the request to the origin and buffer the response
    #[allow(clippy::too_many_arguments)]
    async fn forward(
        &self,
        method: &Method,
        target_url: &str,
        headers: &HeaderMap,
        body: Bytes,
        client_ip: IpAddr,
        host: &str,
        is_https: bool,
    ) -> Result<CachedResponse, EdgeError> {
        debug!("Proxying to: {}", target_url);

        let mut outbound = HeaderMap::new();
        for (name, value) in headers.iter() {
            if name == HOST || name == hyper::header::CONTENT_LENGTH || is_hop_by_hop(name) {
                continue;
            }
            outbound.append(name.clone(), value.clone());
        }

        let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, client_ip),
            None => client_ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            outbound.insert("x-forwarded-for", value);
        }
        if let Ok(value) = HeaderValue::from_str(host) {
            outbound.insert("x-forwarded-host", value);
        }
        outbound.insert(
            "x-forwarded-proto",
            HeaderValue::from_static(if is_https { "https" } else { "http" }),
        );

        let response = self
            .client
            .request(method.clone(), target_url)
            .headers(outbound)
            .body(body)
            .send()
            .await
            .map_err(|e| EdgeError::Origin(e.to_string()))?;

        let status = response.status();
        let mut response_headers = response.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let body = response
            .bytes()
            .await
            .map_err(|e| EdgeError::Origin(e.to_string()))?;

        Ok(CachedResponse {
            status,
            headers: response_headers,
            body,
        })
    }

    /// Response-phase script, headers, accounting
    async fn finish(
        &self,
        host: &str,
        config: Option<&DomainEntry>,
        info: &RequestInfo,
        stored: CachedResponse,
        outcome: Outcome,
        mut script_headers: Vec<(String, String)>,
    ) -> Response<ResponseBody> {
        if let Some(rule) = config.and_then(|c| c.edge_rule(EdgePhase::Response)) {
            let view = ResponseView {
                status: stored.status.as_u16(),
                headers: stored
                    .headers
                    .iter()
                    .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                    .collect(),
            };
            let script = self.edge.execute(host, rule, info, Some(view)).await;
            if let Some((location, code)) = &script.redirect {
                let mut response = redirect_response(location, redirect_status(*code));
                script_headers.extend(script.response_headers);
                apply_script_headers(response.headers_mut(), &script_headers);
                apply_security_headers(response.headers_mut());
                return response;
            }
            script_headers.extend(script.response_headers);
        }

        // A hit is accounted at its cached size, anything else at its body length
        let bytes = if outcome == Outcome::Hit {
            stored.stored_size()
        } else {
            stored.body.len() as u64
        };
        let mut response = Response::new(full_body(stored.body));
        *response.status_mut() = stored.status;
        *response.headers_mut() = stored.headers;

        apply_script_headers(response.headers_mut(), &script_headers);
        if let Some(cors) = config.and_then(|c| c.cors.as_ref()) {
            apply_cors_headers(response.headers_mut(), cors, info.header("origin"));
        }
        apply_security_headers(response.headers_mut());
        response
            .headers_mut()
            .insert("x-cache", HeaderValue::from_static(outcome.as_str()));

        self.analytics.record(host, outcome, bytes);
        crate::metrics::record_request(host, outcome.as_str());
        crate::metrics::record_bandwidth(bytes);
        response
    }
}

/// Hostname from the Host header, or from an absolute-form target
fn request_host<T>(req: &Request<T>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .map(normalize_hostname)
        .filter(|h| !h.is_empty())
}

/// Check if request is from HTTPS (via proxy headers)
fn is_https_request<T>(req: &Request<T>) -> bool {
    if let Some(proto) = req.headers().get("x-forwarded-proto") {
        if proto.to_str().ok() == Some("https") {
            return true;
        }
    }
    if let Some(ssl) = req.headers().get("x-forwarded-ssl") {
        if ssl.to_str().ok() == Some("on") {
            return true;
        }
    }
    if let Some(https) = req.headers().get("front-end-https") {
        if https.to_str().ok() == Some("on") {
            return true;
        }
    }
    false
}

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn redirect_status(code: u16) -> StatusCode {
    StatusCode::from_u16(code)
        .ok()
        .filter(|s| s.is_redirection())
        .unwrap_or(StatusCode::FOUND)
}

/// Request-phase outcome that ends the request here
fn script_response(outcome: &ScriptOutcome) -> Option<Response<ResponseBody>> {
    if let Some((location, code)) = &outcome.redirect {
        return Some(redirect_response(location, redirect_status(*code)));
    }
    if outcome.stop {
        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::NO_CONTENT;
        return Some(response);
    }
    None
}

fn apply_script_headers(headers: &mut HeaderMap, script_headers: &[(String, String)]) {
    for (name, value) in script_headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!(header = %name, "Ignoring invalid header from edge script"),
        }
    }
}

/// Create text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Create error response
pub fn error_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    text_response(status, message)
}

/// Create JSON response
pub fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(json) => {
            let mut response = Response::new(full_body(Bytes::from(json)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

/// Create redirect response
pub fn redirect_response(location: &str, status: StatusCode) -> Response<ResponseBody> {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = Response::new(empty_body());
            *response.status_mut() = status;
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => error_response(StatusCode::BAD_REQUEST, "Invalid redirect location"),
    }
}

/// Create full body
pub fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Create empty body
pub fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_https_request() {
        let req = Request::builder()
            .header("x-forwarded-proto", "https")
            .body(())
            .unwrap();
        assert!(is_https_request(&req));

        let req = Request::builder().body(()).unwrap();
        assert!(!is_https_request(&req));
    }

    #[test]
    fn test_request_host_normalized() {
        let req = Request::builder()
            .header("host", "Shop.Example:8080")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("shop.example"));

        let req = Request::builder()
            .uri("http://blog.example/path")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("blog.example"));

        let req = Request::builder().uri("/path").body(()).unwrap();
        assert!(request_host(&req).is_none());
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn test_redirect_status_falls_back_to_found() {
        assert_eq!(redirect_status(301), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(redirect_status(308), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(redirect_status(200), StatusCode::FOUND);
        assert_eq!(redirect_status(9999), StatusCode::FOUND);
    }

    #[test]
    fn test_script_response() {
        assert!(script_response(&ScriptOutcome::default()).is_none());

        let stop = ScriptOutcome {
            stop: true,
            ..Default::default()
        };
        assert_eq!(script_response(&stop).unwrap().status(), StatusCode::NO_CONTENT);

        let redirect = ScriptOutcome {
            stop: true,
            redirect: Some(("https://new.example/".to_string(), 301)),
            response_headers: vec![],
        };
        let response = script_response(&redirect).unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "https://new.example/");
    }

    #[test]
    fn test_invalid_script_headers_ignored() {
        let mut headers = HeaderMap::new();
        apply_script_headers(
            &mut headers,
            &[
                ("x-edge".to_string(), "1".to_string()),
                ("bad header".to_string(), "x".to_string()),
            ],
        );
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-edge"], "1");
    }
}
