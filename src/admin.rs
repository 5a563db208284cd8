//! Administrative HTTP surface
//!
//! Routes under `/admin/` and `/cdn-purge`, gated by the admin IP whitelist.
//! Session and login handling sit in front of this and are not part of it.

use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::IpAddr;
use tracing::{info, warn};

use crate::cache::PurgeScope;
use crate::domain::{normalize_hostname, OriginSet, UpsertOptions};
use crate::error::EdgeError;
use crate::proxy::{error_response, json_response, EdgeServer, ResponseBody};
use crate::security::admin_allowed;

const MAX_ADMIN_BODY: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct DomainRequest {
    hostname: String,
    origin: OriginSet,
    #[serde(flatten)]
    options: UpsertOptions,
}

#[derive(Debug, Deserialize)]
struct HostnameRequest {
    hostname: String,
}

#[derive(Debug, Serialize)]
struct ProvisionResponse {
    success: bool,
    msg: String,
}

pub async fn handle(
    server: &EdgeServer,
    req: Request<Incoming>,
    client_ip: IpAddr,
) -> Response<ResponseBody> {
    if !admin_allowed(&server.admin_whitelist, &client_ip) {
        warn!(ip = %client_ip, path = %req.uri().path(), "Admin access denied");
        return error_response(StatusCode::FORBIDDEN, "Forbidden");
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::GET, "/admin/domains") => json_response(StatusCode::OK, &server.registry.list_all()),
        (Method::POST, "/admin/domains") => add_domain(server, req).await,
        (Method::DELETE, "/admin/domains") => remove_domain(server, req).await,
        (Method::POST, "/admin/ssl-provision") => provision(server, req).await,
        (Method::GET, "/admin/analytics") => json_response(StatusCode::OK, &server.analytics.snapshot()),
        (Method::GET, "/admin/tunnels") => json_response(StatusCode::OK, &server.websockets.list()),
        (Method::GET, "/cdn-purge") => purge(server, &req),
        _ => error_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, EdgeError> {
    let body: Bytes = Limited::new(req.into_body(), MAX_ADMIN_BODY)
        .collect()
        .await
        .map_err(|e| EdgeError::BadRequest(format!("Failed to read body: {}", e)))?
        .to_bytes();
    Ok(serde_json::from_slice(&body)?)
}

fn failure(err: &EdgeError) -> Response<ResponseBody> {
    json_response(
        err.status(),
        &json!({ "success": false, "error": err.public_message() }),
    )
}

async fn add_domain(server: &EdgeServer, req: Request<Incoming>) -> Response<ResponseBody> {
    let request: DomainRequest = match read_json(req).await {
        Ok(r) => r,
        Err(e) => return failure(&e),
    };

    match server
        .registry
        .upsert(&request.hostname, request.origin, request.options)
        .await
    {
        Ok(entry) => {
            server.tls.invalidate(&entry.hostname);
            json_response(StatusCode::OK, &json!({ "success": true }))
        }
        Err(e) => failure(&e),
    }
}

async fn remove_domain(server: &EdgeServer, req: Request<Incoming>) -> Response<ResponseBody> {
    let request: HostnameRequest = match read_json(req).await {
        Ok(r) => r,
        Err(e) => return failure(&e),
    };

    let removed = server.registry.remove(&request.hostname).await;
    if removed {
        server.tls.invalidate(&request.hostname);
    }
    json_response(StatusCode::OK, &json!({ "success": removed }))
}

async fn provision(server: &EdgeServer, req: Request<Incoming>) -> Response<ResponseBody> {
    let request: HostnameRequest = match read_json(req).await {
        Ok(r) => r,
        Err(e) => return failure(&e),
    };
    let hostname = normalize_hostname(&request.hostname);

    if server.registry.get_config(&hostname).is_none() {
        return json_response(
            StatusCode::NOT_FOUND,
            &ProvisionResponse {
                success: false,
                msg: format!("{} is not a configured domain", hostname),
            },
        );
    }

    match server.certificates.provision_now(&hostname).await {
        Ok(method) => {
            server.tls.invalidate(&hostname);
            info!(hostname = %hostname, method = method.as_str(), "Certificate provisioned from admin");
            json_response(
                StatusCode::OK,
                &ProvisionResponse {
                    success: true,
                    msg: format!("Certificate provisioned for {} ({})", hostname, method.as_str()),
                },
            )
        }
        Err(e) => {
            warn!(hostname = %hostname, error = %e, "Certificate provisioning failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ProvisionResponse {
                    success: false,
                    msg: e.to_string(),
                },
            )
        }
    }
}

fn purge(server: &EdgeServer, req: &Request<Incoming>) -> Response<ResponseBody> {
    let mut path = None;
    let mut domain = None;
    if let Some(query) = req.uri().query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "path" => path = Some(value.into_owned()),
                "domain" => domain = Some(value.into_owned()),
                _ => {}
            }
        }
    }

    let scope = PurgeScope::from_params(path.as_deref(), domain.as_deref());
    let result = server.cache.purge(&scope);
    info!(scope = ?scope, removed = result.removed, "Cache purge");
    json_response(StatusCode::OK, &result)
}
