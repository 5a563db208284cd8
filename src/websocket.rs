//! WebSocket tunnel proxy
//!
//! An upgrade is checked by the filter and resolved through the registry, then
//! the origin connection is opened before the client gets its 101. Each live
//! tunnel is one record owned here; either side ending tears down both.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::error::EdgeError;
use crate::proxy::{empty_body, error_response, is_hop_by_hop, ResponseBody};
use crate::registry::DomainRegistry;
use crate::waf::{RequestInfo, Waf};

const ORIGIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake headers the origin connection generates for itself
const HANDSHAKE_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-accept",
];

/// Client headers to carry into the origin handshake: everything except
/// hop-by-hop and handshake headers
pub fn origin_handshake_headers(client: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in client.iter() {
        if is_hop_by_hop(name) || HANDSHAKE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

/// Public view of a live tunnel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub id: u64,
    pub hostname: String,
    pub origin: String,
    pub client_ip: IpAddr,
    pub connected_at: DateTime<Utc>,
}

struct TunnelRecord {
    info: TunnelInfo,
    close: Option<oneshot::Sender<()>>,
}

pub struct WebSocketProxy {
    registry: Arc<DomainRegistry>,
    waf: Arc<Waf>,
    tunnels: DashMap<u64, TunnelRecord>,
    next_id: AtomicU64,
}

pub fn is_websocket_upgrade<T>(req: &Request<T>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// `http(s)://host/base` + `/path?q` as `ws(s)://host/path?q`
pub fn origin_ws_url(origin: &str, target: &str) -> Result<String, EdgeError> {
    let mut url = url::Url::parse(origin).map_err(|e| EdgeError::Origin(e.to_string()))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| EdgeError::Origin(format!("cannot use {} as a websocket origin", origin)))?;

    let base = url.as_str().trim_end_matches('/');
    let target = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("/{}", target)
    };
    Ok(format!("{}{}", base, target))
}

impl WebSocketProxy {
    pub fn new(registry: Arc<DomainRegistry>, waf: Arc<Waf>) -> Self {
        Self {
            registry,
            waf,
            tunnels: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Filter, then resolve. Returns the origin URL to connect to.
    pub fn verify(&self, hostname: &str, info: &RequestInfo) -> Result<String, EdgeError> {
        let config = self.registry.get_config(hostname);

        let verdict = self.waf.evaluate(info, config.as_deref());
        if verdict.blocked {
            let reason = verdict.reason.unwrap_or_else(|| "blocked".to_string());
            warn!(
                event = "BLOCKED",
                hostname = %hostname,
                ip = %info.client_ip,
                reason = %reason,
                "WebSocket upgrade blocked"
            );
            crate::metrics::record_block(&reason);
            return Err(EdgeError::Blocked(reason));
        }

        self.registry
            .resolve_origin(hostname)
            .ok_or_else(|| EdgeError::DomainNotConfigured(hostname.to_string()))
    }

    /// Handle an upgrade request end to end
    pub async fn accept(
        self: &Arc<Self>,
        req: Request<Incoming>,
        hostname: &str,
        client_ip: IpAddr,
    ) -> Response<ResponseBody> {
        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY).cloned() else {
            return error_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key");
        };

        let (parts, body) = req.into_parts();
        let info = RequestInfo::from_parts(&parts, client_ip);

        let origin = match self.verify(hostname, &info) {
            Ok(origin) => origin,
            Err(e) => return error_response(e.status(), &e.public_message()),
        };

        let target_url = match origin_ws_url(&origin, &info.target) {
            Ok(url) => url,
            Err(e) => return error_response(e.status(), &e.public_message()),
        };

        let mut origin_req = match target_url.as_str().into_client_request() {
            Ok(r) => r,
            Err(e) => {
                warn!(hostname = %hostname, error = %e, "Invalid websocket origin request");
                return error_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };
        for (name, value) in origin_handshake_headers(&parts.headers).iter() {
            origin_req.headers_mut().append(name.clone(), value.clone());
        }
        let forwarded_for = match parts.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, client_ip),
            None => client_ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            origin_req.headers_mut().insert("x-forwarded-for", value);
        }
        if let Ok(value) = HeaderValue::from_str(hostname) {
            origin_req.headers_mut().insert("x-forwarded-host", value);
        }

        let connect = tokio::time::timeout(
            ORIGIN_CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(origin_req),
        )
        .await;
        let (origin_ws, origin_resp) = match connect {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(event = "ERROR", hostname = %hostname, origin = %target_url, error = %e, "WebSocket origin connection failed");
                return error_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
            Err(_) => {
                warn!(event = "ERROR", hostname = %hostname, origin = %target_url, "WebSocket origin connection timed out");
                return error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout");
            }
        };

        let protocol = origin_resp.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();

        let client_req = Request::from_parts(parts, body);
        let proxy = self.clone();
        let hostname = hostname.to_string();
        tokio::spawn(async move {
            match hyper::upgrade::on(client_req).await {
                Ok(upgraded) => {
                    let client_ws =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                    proxy
                        .run_tunnel(client_ws, origin_ws, hostname, origin, client_ip)
                        .await;
                }
                Err(e) => warn!(hostname = %hostname, error = %e, "WebSocket client upgrade failed"),
            }
        });

        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_ACCEPT, derive_accept_key(key.as_bytes()));
        if let Some(protocol) = protocol {
            response = response.header(SEC_WEBSOCKET_PROTOCOL, protocol);
        }

        response
            .body(empty_body())
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"))
    }

    async fn run_tunnel<C, O>(
        &self,
        client: WebSocketStream<C>,
        origin: WebSocketStream<O>,
        hostname: String,
        origin_url: String,
        client_ip: IpAddr,
    ) where
        C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
        O: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (close_tx, mut close_rx) = oneshot::channel();
        self.tunnels.insert(
            id,
            TunnelRecord {
                info: TunnelInfo {
                    id,
                    hostname: hostname.clone(),
                    origin: origin_url,
                    client_ip,
                    connected_at: Utc::now(),
                },
                close: Some(close_tx),
            },
        );
        crate::metrics::set_active_tunnels(self.tunnels.len());
        info!(tunnel_id = id, hostname = %hostname, ip = %client_ip, "WebSocket tunnel opened");

        let (mut client_tx, mut client_rx) = client.split();
        let (mut origin_tx, mut origin_rx) = origin.split();

        loop {
            tokio::select! {
                msg = client_rx.next() => match msg {
                    Some(Ok(Message::Close(frame))) => {
                        let _ = origin_tx.send(Message::Close(frame)).await;
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(msg)) => {
                        if origin_tx.send(msg).await.is_err() {
                            let _ = client_tx.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(tunnel_id = id, error = %e, "Client side failed");
                        let _ = origin_tx.send(Message::Close(None)).await;
                        break;
                    }
                    None => {
                        let _ = origin_tx.send(Message::Close(None)).await;
                        break;
                    }
                },
                msg = origin_rx.next() => match msg {
                    Some(Ok(Message::Close(frame))) => {
                        let _ = client_tx.send(Message::Close(frame)).await;
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(msg)) => {
                        if client_tx.send(msg).await.is_err() {
                            let _ = origin_tx.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(tunnel_id = id, error = %e, "Origin side failed");
                        let _ = client_tx.send(Message::Close(None)).await;
                        break;
                    }
                    None => {
                        let _ = client_tx.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = &mut close_rx => {
                    let frame = || CloseFrame {
                        code: CloseCode::Away,
                        reason: "Server shutting down".into(),
                    };
                    let _ = client_tx.send(Message::Close(Some(frame()))).await;
                    let _ = origin_tx.send(Message::Close(Some(frame()))).await;
                    break;
                }
            }
        }

        let _ = client_tx.close().await;
        let _ = origin_tx.close().await;

        self.tunnels.remove(&id);
        crate::metrics::set_active_tunnels(self.tunnels.len());
        info!(tunnel_id = id, hostname = %hostname, "WebSocket tunnel closed");
    }

    pub fn active_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn list(&self) -> Vec<TunnelInfo> {
        let mut tunnels: Vec<TunnelInfo> = self.tunnels.iter().map(|t| t.info.clone()).collect();
        tunnels.sort_by_key(|t| t.id);
        tunnels
    }

    /// Close every live tunnel with 1001 and clear the live set
    pub fn close_all(&self) -> usize {
        let ids: Vec<u64> = self.tunnels.iter().map(|t| *t.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, mut record)) = self.tunnels.remove(&id) {
                if let Some(close) = record.close.take() {
                    let _ = close.send(());
                }
                closed += 1;
            }
        }
        crate::metrics::set_active_tunnels(0);
        if closed > 0 {
            info!(closed, "Closed all WebSocket tunnels");
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OriginSet, UpsertOptions};
    use crate::security::IpList;
    use tempfile::tempdir;

    #[test]
    fn test_origin_ws_url() {
        assert_eq!(
            origin_ws_url("http://origin.internal:3000", "/chat?room=1").unwrap(),
            "ws://origin.internal:3000/chat?room=1"
        );
        assert_eq!(
            origin_ws_url("https://origin.internal/", "/socket").unwrap(),
            "wss://origin.internal/socket"
        );
    }

    #[test]
    fn test_handshake_headers_keep_custom_and_drop_handshake() {
        let mut client = HeaderMap::new();
        client.insert("x-api-key", HeaderValue::from_static("secret"));
        client.insert("x-tenant", HeaderValue::from_static("blue"));
        client.insert("sec-websocket-protocol", HeaderValue::from_static("chat"));
        client.insert("host", HeaderValue::from_static("chat.example"));
        client.insert("upgrade", HeaderValue::from_static("websocket"));
        client.insert("connection", HeaderValue::from_static("Upgrade"));
        client.insert("sec-websocket-key", HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
        client.insert("sec-websocket-version", HeaderValue::from_static("13"));
        client.insert("sec-websocket-extensions", HeaderValue::from_static("permessage-deflate"));

        let forwarded = origin_handshake_headers(&client);
        assert_eq!(forwarded["x-api-key"], "secret");
        assert_eq!(forwarded["x-tenant"], "blue");
        assert_eq!(forwarded["sec-websocket-protocol"], "chat");
        for dropped in [
            "host",
            "upgrade",
            "connection",
            "sec-websocket-key",
            "sec-websocket-version",
            "sec-websocket-extensions",
        ] {
            assert!(!forwarded.contains_key(dropped), "{} should not be forwarded", dropped);
        }
    }

    fn info(target: &str) -> RequestInfo {
        RequestInfo {
            method: "GET".to_string(),
            target: target.to_string(),
            path: target.to_string(),
            headers: vec![],
            client_ip: "10.0.0.1".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_verify_blocks_then_resolves() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(DomainRegistry::open(dir.path().join("d.json"), None, Duration::from_secs(5)));
        registry
            .upsert("chat.example", OriginSet::from("http://origin.internal"), UpsertOptions::default())
            .await
            .unwrap();
        let proxy = WebSocketProxy::new(registry, Arc::new(Waf::new(IpList::default())));

        assert!(matches!(
            proxy.verify("chat.example", &info("/socket/../../etc/passwd")),
            Err(EdgeError::Blocked(_))
        ));
        assert!(matches!(
            proxy.verify("unknown.example", &info("/socket")),
            Err(EdgeError::DomainNotConfigured(_))
        ));
        assert_eq!(
            proxy.verify("chat.example", &info("/socket")).unwrap(),
            "http://origin.internal"
        );
    }

    #[test]
    fn test_close_all_on_empty_set() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(DomainRegistry::open(dir.path().join("d.json"), None, Duration::from_secs(5)));
        let proxy = WebSocketProxy::new(registry, Arc::new(Waf::new(IpList::default())));
        assert_eq!(proxy.close_all(), 0);
        assert_eq!(proxy.active_count(), 0);
    }
}
