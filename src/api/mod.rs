//! HTTP surface of the load balancer.
//!
//! `/metrics` and `/health` are answered locally, as are the admin
//! endpoints under `/api/protection`, `/api/stats` and `/api/servers`.
//! Every other request goes through the admission pipeline and, if
//! admitted, to a backend.

use std::sync::Arc;
use std::time::Instant;

use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::http::{Method, StatusCode};
use actix_web::middleware::DefaultHeaders;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::core::engine::Engine;
use crate::core::health::BackendStatus;
use crate::core::features::RequestInfo;
use crate::core::proxy::{ProxyRequest, LOAD_BALANCER_ID};
use crate::error::GatewayError;
use crate::utils::client_identity;

/// Largest request body the proxy buffers
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Route table for the load balancer
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
        .service(
            web::resource("/metrics")
                .wrap(cors())
                .route(web::get().to(metrics))
                .route(web::method(Method::OPTIONS).to(preflight)),
        )
        .service(
            web::resource("/health")
                .wrap(cors())
                .route(web::get().to(health))
                .route(web::method(Method::OPTIONS).to(preflight)),
        )
        .service(
            web::scope("/api/protection")
                .wrap(cors())
                .route("/block-ip", web::post().to(block_ip))
                .route("/unblock-ip", web::post().to(unblock_ip))
                .route("/{action}", web::method(Method::OPTIONS).to(preflight)),
        )
        .service(
            web::resource("/api/stats")
                .wrap(cors())
                .route(web::get().to(stats))
                .route(web::method(Method::OPTIONS).to(preflight)),
        )
        .service(
            web::resource("/api/servers")
                .wrap(cors())
                .route(web::get().to(list_servers))
                .route(web::post().to(add_server))
                .route(web::method(Method::OPTIONS).to(preflight)),
        )
        .service(
            web::resource("/api/servers/{id}")
                .wrap(cors())
                .route(web::delete().to(remove_server))
                .route(web::method(Method::OPTIONS).to(preflight)),
        )
        .default_service(web::to(proxy));
}

fn cors() -> DefaultHeaders {
    DefaultHeaders::new()
        .add(("Access-Control-Allow-Origin", "*"))
        .add(("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS"))
        .add(("Access-Control-Allow-Headers", "Content-Type"))
}

async fn preflight() -> impl Responder {
    HttpResponse::NoContent().finish()
}

async fn metrics(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.engine.metrics().snapshot())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub active_servers: Vec<String>,
    pub last_updated: u64,
}

async fn health(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        active_servers: state.engine.pool().healthy_addresses(),
        last_updated: state.engine.metrics().last_updated(),
    })
}

/// Body of the block/unblock endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct IpRequest {
    #[serde(default)]
    pub ip: String,
}

fn required_ip(body: &IpRequest) -> Result<&str, GatewayError> {
    let ip = body.ip.trim();
    if ip.is_empty() {
        return Err(GatewayError::BadRequest("IP address is required".to_string()));
    }
    Ok(ip)
}

async fn block_ip(
    state: web::Data<AppState>,
    body: web::Json<IpRequest>,
) -> Result<HttpResponse, GatewayError> {
    let ip = required_ip(&body)?;
    state.engine.block(ip);
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("IP {} blocked", ip),
    })))
}

async fn unblock_ip(
    state: web::Data<AppState>,
    body: web::Json<IpRequest>,
) -> Result<HttpResponse, GatewayError> {
    let ip = required_ip(&body)?;
    state.engine.unblock(ip);
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("IP {} unblocked", ip),
    })))
}

async fn stats(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "success": true,
        "data": state.engine.stats(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn list_servers(state: web::Data<AppState>) -> impl Responder {
    let servers: Vec<BackendStatus> = state
        .engine
        .pool()
        .servers()
        .iter()
        .map(|s| s.status())
        .collect();
    HttpResponse::Ok().json(json!({ "success": true, "servers": servers }))
}

/// Body of `POST /api/servers`
#[derive(Debug, Serialize, Deserialize)]
pub struct AddServerRequest {
    #[serde(default, alias = "url")]
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

async fn add_server(
    state: web::Data<AppState>,
    body: web::Json<AddServerRequest>,
) -> Result<HttpResponse, GatewayError> {
    let address = body.address.trim();
    if address.is_empty() {
        return Err(GatewayError::BadRequest("Server URL is required".to_string()));
    }
    let server = state.engine.add_backend(address, body.weight).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "server": server.status() })))
}

async fn remove_server(
    state: web::Data<AppState>,
    id: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    state
        .engine
        .remove_backend(&id)
        .ok_or_else(|| GatewayError::NotFound("Server not found".to_string()))?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "message": "Server removed" })))
}

/// Framework-independent view of the request for feature extraction
fn request_info(req: &HttpRequest, body: &web::Bytes) -> RequestInfo {
    // "METHOD URI HTTP/1.1\r\n"
    let request_line = req.method().as_str().len() + req.uri().to_string().len() + 12;
    let header_bytes: usize = req
        .headers()
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum();
    let content_length = req
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(body.len() as u64);

    RequestInfo {
        method: req.method().to_string(),
        path: req.path().to_string(),
        header_bytes: (request_line + header_bytes) as u64,
        content_length,
        user_agent: req
            .headers()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string(),
        encrypted: req.connection_info().scheme() == "https",
        source_port: req.peer_addr().map(|addr| addr.port()),
        dest_port: Some(req.app_config().local_addr().port()),
    }
}

/// Catch-all: admit, route and stream the upstream response back
async fn proxy(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let started = Instant::now();
    let engine = &state.engine;
    let config = engine.config();

    let identity = client_identity(
        req.headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok()),
        req.peer_addr(),
        config.server.trust_forwarded_for,
    );
    let info = request_info(&req, &body);

    let decision = engine.admit(&identity, &info).await;
    if let Some(rejection) = GatewayError::from_decision(decision, config.rate_limit.points) {
        return Err(rejection);
    }

    let connection = req.connection_info().clone();
    let request = ProxyRequest {
        method: req.method().to_string(),
        path_and_query: req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers: req
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect(),
        body,
        peer_ip: req
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| identity.clone()),
        scheme: connection.scheme().to_string(),
        host: Some(connection.host().to_string()),
        request_id: Uuid::new_v4().to_string(),
    };

    let outcome = engine.forward(request).await?;
    debug!(
        "Proxied {} {} -> {} in {}ms",
        info.method, info.path, outcome.backend, outcome.elapsed_ms
    );

    let status = StatusCode::from_u16(outcome.status()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = HttpResponse::build(status);
    for (name, value) in outcome.headers() {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value),
        ) {
            response.append_header((name, value));
        }
    }
    response
        .insert_header(("X-Response-Time", format!("{}ms", started.elapsed().as_millis())))
        .insert_header(("X-LoadBalancer", LOAD_BALANCER_ID));

    Ok(response.streaming(outcome.into_body()))
}
