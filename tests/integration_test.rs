//! Integration tests for edgemux
//!
//! Tests the full edge server including:
//! - Domain resolution and the unconfigured-domain rejection
//! - Static filtering with no origin contact
//! - Cache HIT/MISS and purge
//! - Admin surface
//! - Edge scripts
//! - WebSocket tunneling
//! - HTTPS with per-hostname certificates

use bytes::Bytes;
use edgemux::config::RateLimitConfig;
use edgemux::domain::{CorsPolicy, EdgePhase, EdgeRule};
use edgemux::{
    Analytics, CertificateManager, DomainRegistry, EdgeConfig, EdgeServer, OriginSet, Shutdown,
    UpsertOptions,
};
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19000);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Simple origin server for testing. Counts every request it sees.
async fn run_origin_server(port: u16, response_body: &'static str) -> Arc<AtomicUsize> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let counter = counter.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let target = req
                            .uri()
                            .path_and_query()
                            .map(|pq| pq.as_str().to_string())
                            .unwrap_or_default();
                        let x_forwarded_for = req
                            .headers()
                            .get("x-forwarded-for")
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("none");
                        let x_forwarded_host = req
                            .headers()
                            .get("x-forwarded-host")
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("none");

                        let response_text = format!(
                            "{}|target={}|xff={}|xfh={}",
                            response_body, target, x_forwarded_for, x_forwarded_host
                        );

                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(200)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from(response_text)))
                                .unwrap(),
                        )
                    }
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    hits
}

/// WebSocket origin: greets with a binary frame, then echoes and reports
/// every binary message it receives
async fn run_websocket_origin(port: u16) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let _ = ws.send(Message::Binary(b"hello-from-origin".to_vec())).await;
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Binary(data) => {
                            let _ = tx.send(data.clone());
                            let _ = ws.send(Message::Binary(data)).await;
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    rx
}

/// WebSocket origin that greets with the `x-api-key` it saw in the handshake
async fn run_header_echo_websocket_origin(port: u16) {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut api_key = String::from("none");
                let callback = |req: &HandshakeRequest, resp: HandshakeResponse| {
                    if let Some(value) = req.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
                        api_key = value.to_string();
                    }
                    Ok::<_, ErrorResponse>(resp)
                };
                let mut ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let _ = ws.send(Message::Text(api_key)).await;
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Close(_) = msg {
                        break;
                    }
                }
            });
        }
    });
}

struct TestEdge {
    server: Arc<EdgeServer>,
    port: u16,
    https_port: u16,
    shutdown: Shutdown,
    _dir: TempDir,
}

impl TestEdge {
    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    async fn add_domain(&self, hostname: &str, origin: &str, options: UpsertOptions) {
        self.server
            .registry()
            .upsert(hostname, OriginSet::from(origin), options)
            .await
            .unwrap();
    }
}

/// Create and start a test edge server
async fn start_edge(configure: impl FnOnce(&mut EdgeConfig)) -> TestEdge {
    let dir = tempdir().unwrap();
    let port = get_unique_port();
    let https_port = get_unique_port();

    let mut config = EdgeConfig {
        http_port: port,
        https_port,
        rate_limit: RateLimitConfig {
            window: Duration::from_secs(60),
            max_requests: 0,
        },
        analytics_path: dir.path().join("analytics.json"),
        ..Default::default()
    };
    config.registry.snapshot_path = dir.path().join("domains.json");
    config.certificates.certs_dir = dir.path().join("certs");
    configure(&mut config);

    let registry = Arc::new(DomainRegistry::open(
        &config.registry.snapshot_path,
        None,
        config.registry.sync_interval,
    ));
    let certificates = Arc::new(CertificateManager::new(config.certificates.clone()).unwrap());
    let analytics = Arc::new(Analytics::open(&config.analytics_path));
    let server = Arc::new(EdgeServer::new(config, registry, certificates, analytics).unwrap());

    let shutdown = Shutdown::new();
    let server_clone = server.clone();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        let _ = server_clone.run(shutdown_clone).await;
    });

    // Wait for server to start
    sleep(Duration::from_millis(150)).await;

    TestEdge {
        server,
        port,
        https_port,
        shutdown,
        _dir: dir,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let edge = start_edge(|_| {}).await;

    let response = client().get(edge.url("/health")).send().await.unwrap();

    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_unconfigured_domain_404() {
    let edge = start_edge(|_| {}).await;

    let response = client()
        .get(edge.url("/anything"))
        .header("host", "nobody.example")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    assert!(response.text().await.unwrap().contains("Domain Not Configured"));
}

#[tokio::test]
async fn test_proxy_miss_then_hit() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let hits = run_origin_server(origin_port, "origin").await;
    edge.add_domain(
        "shop.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions::default(),
    )
    .await;

    let first = client()
        .get(edge.url("/products?b=2&a=1"))
        .header("host", "shop.example")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.headers()["x-cache"], "MISS");
    assert_eq!(first.headers()["x-frame-options"], "SAMEORIGIN");
    let body = first.text().await.unwrap();
    assert!(body.starts_with("origin|target=/products?b=2&a=1"));
    assert!(body.contains("xff=127.0.0.1"));
    assert!(body.contains("xfh=shop.example"));

    // Same query in a different order shares the cache key
    let second = client()
        .get(edge.url("/products?a=1&b=2"))
        .header("host", "shop.example")
        .send()
        .await
        .unwrap();
    assert_eq!(second.headers()["x-cache"], "HIT");
    assert_eq!(second.text().await.unwrap(), body);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let snapshot = edge.server.analytics().snapshot();
    assert_eq!(snapshot.totals.hits, 1);
    assert_eq!(snapshot.totals.misses, 1);
    // The miss counts its body, the hit counts the whole cached entry
    assert_eq!(
        snapshot.totals.bandwidth,
        body.len() as u64 + edge.server.cache().size_bytes()
    );
}

#[tokio::test]
async fn test_head_does_not_fill_get_cache() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let hits = run_origin_server(origin_port, "page").await;
    edge.add_domain(
        "shop.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions::default(),
    )
    .await;

    let head = client()
        .head(edge.url("/page"))
        .header("host", "shop.example")
        .send()
        .await
        .unwrap();
    assert_eq!(head.status(), 200);
    assert_eq!(head.headers()["x-cache"], "MISS");
    assert!(edge.server.cache().is_empty());

    let get = client()
        .get(edge.url("/page"))
        .header("host", "shop.example")
        .send()
        .await
        .unwrap();
    assert_eq!(get.headers()["x-cache"], "MISS");
    assert!(get.text().await.unwrap().starts_with("page|target=/page"));

    // HEAD may be answered from the GET entry
    let head = client()
        .head(edge.url("/page"))
        .header("host", "shop.example")
        .send()
        .await
        .unwrap();
    assert_eq!(head.headers()["x-cache"], "HIT");

    let get = client()
        .get(edge.url("/page"))
        .header("host", "shop.example")
        .send()
        .await
        .unwrap();
    assert_eq!(get.headers()["x-cache"], "HIT");
    assert!(get.text().await.unwrap().starts_with("page|target=/page"));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_post_is_forwarded_without_caching() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let hits = run_origin_server(origin_port, "origin").await;
    edge.add_domain(
        "shop.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions::default(),
    )
    .await;

    for _ in 0..2 {
        let response = client()
            .post(edge.url("/cart"))
            .header("host", "shop.example")
            .body("item=1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["x-cache"], "BYPASS");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(edge.server.cache().is_empty());
}

#[tokio::test]
async fn test_static_waf_blocks_without_origin_contact() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let hits = run_origin_server(origin_port, "origin").await;
    edge.add_domain(
        "shop.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions::default(),
    )
    .await;

    let attacks = [
        "/item?id=1%20OR%201=1",
        "/search?q=%3Cscript%3Ealert(1)%3C/script%3E",
        "/static/..%2f..%2fetc/passwd",
        "/.git/config",
    ];

    for attack in attacks {
        let response = client()
            .get(edge.url(attack))
            .header("host", "shop.example")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 403, "expected {} to be blocked", attack);
    }

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(edge.server.analytics().snapshot().totals.blocked, 4);
}

#[tokio::test]
async fn test_tenant_blocked_ip() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let hits = run_origin_server(origin_port, "origin").await;
    edge.add_domain(
        "shop.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions {
            blocked_ips: vec!["127.0.0.0/8".to_string()],
            ..Default::default()
        },
    )
    .await;

    let response = client()
        .get(edge.url("/"))
        .header("host", "shop.example")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cors_preflight_and_response_headers() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let hits = run_origin_server(origin_port, "api").await;
    edge.add_domain(
        "api.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions {
            cors: Some(CorsPolicy {
                allowed_origins: vec!["https://app.example".to_string()],
                allow_credentials: true,
                ..Default::default()
            }),
            ..Default::default()
        },
    )
    .await;

    let preflight = client()
        .request(reqwest::Method::OPTIONS, edge.url("/v1/items"))
        .header("host", "api.example")
        .header("origin", "https://app.example")
        .header("access-control-request-method", "PUT")
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), 204);
    assert_eq!(
        preflight.headers()["access-control-allow-origin"],
        "https://app.example"
    );
    assert_eq!(preflight.headers()["access-control-allow-credentials"], "true");
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let response = client()
        .get(edge.url("/v1/items"))
        .header("host", "api.example")
        .header("origin", "https://app.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "https://app.example"
    );
    assert_eq!(response.headers()["access-control-max-age"], "86400");

    // Served from cache, answered for the new request's origin
    let other = client()
        .get(edge.url("/v1/items"))
        .header("host", "api.example")
        .header("origin", "https://evil.example")
        .send()
        .await
        .unwrap();
    assert_eq!(other.headers()["x-cache"], "HIT");
    assert!(other.headers().get("access-control-allow-origin").is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_options_without_cors_policy_reaches_origin() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let hits = run_origin_server(origin_port, "plain").await;
    edge.add_domain(
        "plain.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions::default(),
    )
    .await;

    let response = client()
        .request(reqwest::Method::OPTIONS, edge.url("/"))
        .header("host", "plain.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get("access-control-allow-origin").is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_origin_unreachable_502() {
    let edge = start_edge(|_| {}).await;
    let dead_port = get_unique_port();
    edge.add_domain(
        "down.example",
        &format!("http://127.0.0.1:{}", dead_port),
        UpsertOptions::default(),
    )
    .await;

    let response = client()
        .get(edge.url("/"))
        .header("host", "down.example")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert_eq!(edge.server.analytics().snapshot().totals.errors, 1);
}

#[tokio::test]
async fn test_purge_all_and_scoped() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let hits = run_origin_server(origin_port, "origin").await;
    let origin = format!("http://127.0.0.1:{}", origin_port);
    edge.add_domain("a.example", &origin, UpsertOptions::default()).await;
    edge.add_domain("b.example", &origin, UpsertOptions::default()).await;

    let fetch = |host: &'static str, path: &'static str| {
        let url = edge.url(path);
        async move {
            client()
                .get(url)
                .header("host", host)
                .send()
                .await
                .unwrap()
                .headers()["x-cache"]
                .to_str()
                .unwrap()
                .to_string()
        }
    };

    assert_eq!(fetch("a.example", "/images/1.png").await, "MISS");
    assert_eq!(fetch("a.example", "/css/site.css").await, "MISS");
    assert_eq!(fetch("b.example", "/images/1.png").await, "MISS");

    let purge = client()
        .get(edge.url("/cdn-purge?path=/images&domain=a.example"))
        .send()
        .await
        .unwrap();
    assert_eq!(purge.status(), 200);
    let result: serde_json::Value = serde_json::from_str(&purge.text().await.unwrap()).unwrap();
    assert_eq!(result["purged"], true);

    assert_eq!(fetch("a.example", "/images/1.png").await, "MISS");
    assert_eq!(fetch("a.example", "/css/site.css").await, "HIT");
    assert_eq!(fetch("b.example", "/images/1.png").await, "HIT");

    // A path with no domain purges nothing
    let purge = client()
        .get(edge.url("/cdn-purge?path=/images"))
        .send()
        .await
        .unwrap();
    let result: serde_json::Value = serde_json::from_str(&purge.text().await.unwrap()).unwrap();
    assert_eq!(result["purged"], false);

    let purge = client().get(edge.url("/cdn-purge?path=all")).send().await.unwrap();
    assert_eq!(purge.status(), 200);
    assert!(edge.server.cache().is_empty());
    assert_eq!(fetch("b.example", "/images/1.png").await, "MISS");
    assert_eq!(hits.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_admin_domain_lifecycle() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let _hits = run_origin_server(origin_port, "admin-origin").await;

    let body = serde_json::json!({
        "hostname": "New.Example",
        "origin": format!("http://127.0.0.1:{}", origin_port),
        "plan": "pro"
    });
    let response = client()
        .post(edge.url("/admin/domains"))
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let result: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(result["success"], true);

    // Visible immediately, without waiting for reconciliation
    let proxied = client()
        .get(edge.url("/"))
        .header("host", "new.example")
        .send()
        .await
        .unwrap();
    assert!(proxied.text().await.unwrap().starts_with("admin-origin"));

    let listing = client().get(edge.url("/admin/domains")).send().await.unwrap();
    let domains: serde_json::Value = serde_json::from_str(&listing.text().await.unwrap()).unwrap();
    assert_eq!(domains["new.example"]["plan"], "pro");

    let bad = client()
        .post(edge.url("/admin/domains"))
        .body(r#"{"hostname":"bad.example","origin":"not a url"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);

    let response = client()
        .delete(edge.url("/admin/domains"))
        .body(r#"{"hostname":"new.example"}"#)
        .send()
        .await
        .unwrap();
    let result: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(result["success"], true);

    let gone = client()
        .get(edge.url("/"))
        .header("host", "new.example")
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn test_admin_whitelist_denies_other_ips() {
    let edge = start_edge(|config| {
        config.admin_whitelist = vec!["10.0.0.0/8".to_string()];
    })
    .await;

    let response = client().get(edge.url("/admin/domains")).send().await.unwrap();
    assert_eq!(response.status(), 403);

    let response = client().get(edge.url("/cdn-purge")).send().await.unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_ssl_provision_endpoint() {
    let edge = start_edge(|_| {}).await;
    edge.add_domain("secure.example", "http://127.0.0.1:1", UpsertOptions::default())
        .await;

    let response = client()
        .post(edge.url("/admin/ssl-provision"))
        .body(r#"{"hostname":"secure.example"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let result: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(result["success"], true);

    let response = client()
        .post(edge.url("/admin/ssl-provision"))
        .body(r#"{"hostname":"unknown.example"}"#)
        .send()
        .await
        .unwrap();
    let result: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(result["success"], false);
}

#[tokio::test]
async fn test_edge_script_redirect_and_headers() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let hits = run_origin_server(origin_port, "origin").await;
    edge.add_domain(
        "shop.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions {
            edge_rules: vec![
                EdgeRule {
                    id: "legacy-redirect".to_string(),
                    script: r#"
                        if request.url == "/old" {
                            redirect("https://shop.example/new", 301)
                        }
                    "#
                    .to_string(),
                    phase: EdgePhase::Request,
                },
                EdgeRule {
                    id: "tag".to_string(),
                    script: r#"set_response_header("x-origin-status", response.status.to_string());"#
                        .to_string(),
                    phase: EdgePhase::Response,
                },
            ],
            ..Default::default()
        },
    )
    .await;

    let redirected = client()
        .get(edge.url("/old"))
        .header("host", "shop.example")
        .send()
        .await
        .unwrap();
    assert_eq!(redirected.status(), 301);
    assert_eq!(redirected.headers()["location"], "https://shop.example/new");
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let passed = client()
        .get(edge.url("/kept"))
        .header("host", "shop.example")
        .send()
        .await
        .unwrap();
    assert_eq!(passed.status(), 200);
    assert_eq!(passed.headers()["x-origin-status"], "200");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_edge_script_fails_open() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let hits = run_origin_server(origin_port, "origin").await;
    edge.add_domain(
        "shop.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions {
            edge_rules: vec![EdgeRule {
                id: "spin".to_string(),
                script: "loop { }".to_string(),
                phase: EdgePhase::Request,
            }],
            ..Default::default()
        },
    )
    .await;

    let response = client()
        .get(edge.url("/"))
        .header("host", "shop.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rate_limit_429() {
    let edge = start_edge(|config| {
        config.rate_limit.max_requests = 2;
    })
    .await;
    let origin_port = get_unique_port();
    let _hits = run_origin_server(origin_port, "origin").await;
    edge.add_domain(
        "shop.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions::default(),
    )
    .await;

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = client()
            .get(edge.url("/"))
            .header("host", "shop.example")
            .send()
            .await
            .unwrap();
        statuses.push(response.status().as_u16());
    }
    assert_eq!(statuses, vec![200, 200, 429]);

    // Health stays reachable
    let health = client().get(edge.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn test_force_https_redirect() {
    let edge = start_edge(|config| {
        config.force_https = true;
    })
    .await;

    let response = client()
        .get(edge.url("/page?x=1"))
        .header("host", "shop.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 301);
    assert_eq!(response.headers()["location"], "https://shop.example/page?x=1");

    let health = client().get(edge.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn test_acme_challenge_route() {
    let edge = start_edge(|_| {}).await;

    let missing = client()
        .get(edge.url("/.well-known/acme-challenge/unknown"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

async fn connect_tunnel(
    edge: &TestEdge,
    host: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let mut request = format!("ws://127.0.0.1:{}/socket", edge.port)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("host", host.parse().unwrap());
    let (ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.status(), 101);
    ws
}

#[tokio::test]
async fn test_websocket_tunnel_binary_roundtrip() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let mut received = run_websocket_origin(origin_port).await;
    edge.add_domain(
        "chat.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions::default(),
    )
    .await;

    let mut ws = connect_tunnel(&edge, "chat.example").await;

    // Origin to client
    match ws.next().await {
        Some(Ok(Message::Binary(data))) => assert_eq!(data, b"hello-from-origin".to_vec()),
        other => panic!("unexpected message: {:?}", other),
    }
    assert_eq!(edge.server.websockets().active_count(), 1);

    // Client to origin, byte for byte
    let payload = vec![0u8, 1, 2, 254, 255];
    ws.send(Message::Binary(payload.clone())).await.unwrap();
    let at_origin = tokio::time::timeout(Duration::from_secs(2), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(at_origin, payload);

    match ws.next().await {
        Some(Ok(Message::Binary(data))) => assert_eq!(data, payload),
        other => panic!("unexpected message: {:?}", other),
    }

    ws.close(None).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(edge.server.websockets().active_count(), 0);
}

#[tokio::test]
async fn test_websocket_forwards_client_headers() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    run_header_echo_websocket_origin(origin_port).await;
    edge.add_domain(
        "chat.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions::default(),
    )
    .await;

    let mut request = format!("ws://127.0.0.1:{}/socket", edge.port)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("host", "chat.example".parse().unwrap());
    request
        .headers_mut()
        .insert("x-api-key", "tenant-key-42".parse().unwrap());
    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.status(), 101);

    match tokio::time::timeout(Duration::from_secs(2), ws.next()).await.unwrap() {
        Some(Ok(Message::Text(key))) => assert_eq!(key, "tenant-key-42"),
        other => panic!("unexpected message: {:?}", other),
    }
    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_websocket_rejects_unknown_and_blocked() {
    let edge = start_edge(|_| {}).await;

    let mut request = format!("ws://127.0.0.1:{}/socket", edge.port)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("host", "nobody.example".parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_err());

    let mut request = format!("ws://127.0.0.1:{}/.git/config", edge.port)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("host", "nobody.example".parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_err());
    assert_eq!(edge.server.websockets().active_count(), 0);
}

#[tokio::test]
async fn test_shutdown_closes_tunnels() {
    let edge = start_edge(|_| {}).await;
    let origin_port = get_unique_port();
    let _received = run_websocket_origin(origin_port).await;
    edge.add_domain(
        "chat.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions::default(),
    )
    .await;

    let mut ws = connect_tunnel(&edge, "chat.example").await;
    let _greeting = ws.next().await;
    assert_eq!(edge.server.websockets().active_count(), 1);

    edge.shutdown.trigger();
    assert_eq!(edge.server.websockets().close_all(), 1);
    assert_eq!(edge.server.websockets().active_count(), 0);

    match tokio::time::timeout(Duration::from_secs(2), ws.next()).await.unwrap() {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_https_per_hostname_certificates() {
    let edge = start_edge(|config| {
        config.enable_https = true;
    })
    .await;
    let origin_port = get_unique_port();
    let _hits = run_origin_server(origin_port, "secure-origin").await;
    edge.add_domain(
        "secure.example",
        &format!("http://127.0.0.1:{}", origin_port),
        UpsertOptions::default(),
    )
    .await;

    let https_addr: SocketAddr = format!("127.0.0.1:{}", edge.https_port).parse().unwrap();
    let tls_client = |host: &str| {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .resolve(host, https_addr)
            .no_proxy()
            .build()
            .unwrap()
    };

    let response = tls_client("secure.example")
        .get(format!("https://secure.example:{}/page", edge.https_port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("secure-origin|target=/page"));
    assert_eq!(edge.server.tls().cached_count(), 1);

    // No certificate is minted for hostnames nobody registered
    let result = tls_client("stranger.example")
        .get(format!("https://stranger.example:{}/", edge.https_port))
        .send()
        .await;
    assert!(result.is_err());
}
