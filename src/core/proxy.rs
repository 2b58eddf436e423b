//! Upstream request forwarding.
//!
//! A forward sends the client's request to exactly one backend and hands
//! back the upstream response with its body still streaming. It never
//! retries on another backend. Connection failures and timeouts downgrade
//! the backend immediately instead of waiting for the next health probe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::web::Bytes;
use futures::{Stream, StreamExt};
use log::{error, warn};
use thiserror::Error;

use crate::core::analytics::MetricsAggregator;
use crate::core::health::{BackendPool, BackendServer};
use crate::models::ProxyConfig;

/// Value of the `X-LoadBalancer` header
pub const LOAD_BALANCER_ID: &str = concat!("ddos-load-balancer/", env!("CARGO_PKG_VERSION"));

/// Connection-scoped headers that must not cross the proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to build upstream client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Backend {backend} unreachable: {source}")]
    Connect {
        backend: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Backend {backend} did not respond within {timeout_ms}ms")]
    Timeout { backend: String, timeout_ms: u64 },
    #[error("Backend {backend} failed: {source}")]
    Upstream {
        backend: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ProxyError {
    pub fn backend(&self) -> Option<&str> {
        match self {
            ProxyError::Connect { backend, .. }
            | ProxyError::Timeout { backend, .. }
            | ProxyError::Upstream { backend, .. } => Some(backend),
            _ => None,
        }
    }
}

/// The client request as the forwarder needs it
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub method: String,
    /// Path plus query string, starting with `/`
    pub path_and_query: String,
    /// Headers as received; hop-by-hop ones are dropped when forwarding
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
    /// Address of the immediate peer, appended to `X-Forwarded-For`
    pub peer_ip: String,
    /// `http` or `https`
    pub scheme: String,
    pub host: Option<String>,
    pub request_id: String,
}

impl ProxyRequest {
    fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Headers to send upstream: the end-to-end ones plus forwarding headers
    pub fn upstream_headers(&self) -> Vec<(String, Vec<u8>)> {
        let mut headers: Vec<(String, Vec<u8>)> = self
            .headers
            .iter()
            .filter(|(name, _)| {
                !is_hop_by_hop(name)
                    && !name.eq_ignore_ascii_case("host")
                    && !name.eq_ignore_ascii_case("content-length")
                    && !name.to_ascii_lowercase().starts_with("x-forwarded-")
                    && !name.eq_ignore_ascii_case("x-request-id")
            })
            .cloned()
            .collect();

        let forwarded_for = match self.header("x-forwarded-for") {
            Some(prior) if !prior.is_empty() => {
                format!("{}, {}", String::from_utf8_lossy(prior), self.peer_ip)
            }
            _ => self.peer_ip.clone(),
        };
        headers.push(("x-forwarded-for".into(), forwarded_for.into_bytes()));
        headers.push(("x-forwarded-proto".into(), self.scheme.clone().into_bytes()));
        if let Some(host) = &self.host {
            headers.push(("x-forwarded-host".into(), host.clone().into_bytes()));
        }
        headers.push(("x-request-id".into(), self.request_id.clone().into_bytes()));
        headers.push(("x-loadbalancer".into(), LOAD_BALANCER_ID.as_bytes().to_vec()));
        headers
    }
}

/// Records the outcome of a forward exactly once.
///
/// If the handler future is dropped before the upstream answered (the
/// client went away) the forward counts as failed.
struct InFlight<'a> {
    metrics: &'a MetricsAggregator,
    backend: &'a str,
    started: Instant,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn start(metrics: &'a MetricsAggregator, backend: &'a str) -> Self {
        metrics.record_attempt(backend);
        Self {
            metrics,
            backend,
            started: Instant::now(),
            finished: false,
        }
    }

    fn finish(mut self, failed: bool) -> u64 {
        self.finished = true;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.metrics.record_outcome(self.backend, elapsed_ms, failed);
        elapsed_ms
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Request to {} abandoned by the client", self.backend);
            let elapsed_ms = self.started.elapsed().as_millis() as u64;
            self.metrics.record_outcome(self.backend, elapsed_ms, true);
        }
    }
}

/// Upstream response whose body has not been read yet
#[derive(Debug)]
pub struct ForwardOutcome {
    pub backend: String,
    pub elapsed_ms: u64,
    response: reqwest::Response,
}

impl ForwardOutcome {
    pub fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    /// End-to-end response headers
    pub fn headers(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .map(|(name, value)| (name.as_str(), value.as_bytes()))
    }

    /// The response body as it arrives. Once headers are out the status
    /// cannot change, so a body failure is only logged.
    pub fn into_body(self) -> impl Stream<Item = Result<Bytes, reqwest::Error>> {
        let backend = self.backend;
        self.response.bytes_stream().inspect(move |chunk| {
            if let Err(e) = chunk {
                warn!("Partial response from {}: {}", backend, e);
            }
        })
    }
}

/// Forwards requests over a shared HTTP client
pub struct ProxyForwarder {
    client: reqwest::Client,
    timeout: Duration,
    pool: Arc<BackendPool>,
    metrics: Arc<MetricsAggregator>,
}

impl ProxyForwarder {
    pub fn new(
        config: &ProxyConfig,
        pool: Arc<BackendPool>,
        metrics: Arc<MetricsAggregator>,
    ) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(ProxyError::Client)?;

        Ok(Self {
            client,
            timeout: Duration::from_millis(config.timeout_ms),
            pool,
            metrics,
        })
    }

    /// Take a backend out of rotation after a failed forward
    fn downgrade(&self, address: &str) {
        if self.pool.mark_unhealthy(address) {
            self.metrics.record_health(self.pool.healthy_addresses());
        }
    }

    /// Send `request` to `backend` and wait for the response headers.
    ///
    /// Statuses of 500 and above are returned to the client unchanged but
    /// counted as backend failures.
    pub async fn forward(
        &self,
        backend: &BackendServer,
        request: ProxyRequest,
    ) -> Result<ForwardOutcome, ProxyError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ProxyError::InvalidRequest(format!("bad method {}", request.method)))?;
        let url = format!("{}{}", backend.address(), request.path_and_query);

        let mut upstream = self.client.request(method, &url);
        for (name, value) in request.upstream_headers() {
            upstream = upstream.header(name.as_str(), value);
        }
        let upstream = upstream.body(request.body);

        let address = backend.address();
        let in_flight = InFlight::start(&self.metrics, address);
        match tokio::time::timeout(self.timeout, upstream.send()).await {
            Ok(Ok(response)) => {
                let failed = response.status().is_server_error();
                let elapsed_ms = in_flight.finish(failed);
                Ok(ForwardOutcome {
                    backend: address.to_string(),
                    elapsed_ms,
                    response,
                })
            }
            Ok(Err(e)) => {
                in_flight.finish(true);
                error!("Proxy error for {} {}: {}", request.method, url, e);
                if e.is_connect() || e.is_timeout() {
                    self.downgrade(address);
                    Err(ProxyError::Connect {
                        backend: address.to_string(),
                        source: e,
                    })
                } else {
                    Err(ProxyError::Upstream {
                        backend: address.to_string(),
                        source: e,
                    })
                }
            }
            Err(_) => {
                in_flight.finish(true);
                error!(
                    "Proxy timeout for {} {} after {}ms",
                    request.method,
                    url,
                    self.timeout.as_millis()
                );
                self.downgrade(address);
                Err(ProxyError::Timeout {
                    backend: address.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};

    fn request(path: &str) -> ProxyRequest {
        ProxyRequest {
            method: "GET".into(),
            path_and_query: path.into(),
            headers: vec![
                ("Connection".into(), b"keep-alive".to_vec()),
                ("Host".into(), b"lb.example".to_vec()),
                ("X-Forwarded-For".into(), b"198.51.100.7".to_vec()),
                ("Accept".into(), b"text/plain".to_vec()),
            ],
            peer_ip: "10.0.0.1".into(),
            scheme: "http".into(),
            host: Some("lb.example".into()),
            request_id: "req-1".into(),
            ..ProxyRequest::default()
        }
    }

    fn forwarder(pool: Arc<BackendPool>, timeout_ms: u64) -> (ProxyForwarder, Arc<MetricsAggregator>) {
        let metrics = Arc::new(MetricsAggregator::new(&pool.addresses()));
        let config = ProxyConfig {
            timeout_ms,
            connect_timeout_ms: 500,
        };
        (ProxyForwarder::new(&config, pool, metrics.clone()).unwrap(), metrics)
    }

    async fn echo_headers(req: HttpRequest) -> HttpResponse {
        let mut seen: Vec<String> = req
            .headers()
            .iter()
            .map(|(n, v)| format!("{}={}", n, v.to_str().unwrap_or("")))
            .collect();
        seen.sort();
        HttpResponse::Ok().body(seen.join("\n"))
    }

    fn spawn_backend() -> String {
        let server = HttpServer::new(|| {
            App::new()
                .route("/echo", web::get().to(echo_headers))
                .route(
                    "/fail",
                    web::get().to(|| async { HttpResponse::InternalServerError().finish() }),
                )
                .route(
                    "/slow",
                    web::get().to(|| async {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        HttpResponse::Ok().finish()
                    }),
                )
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        format!("http://{}", addr)
    }

    #[test]
    fn test_upstream_headers() {
        let headers = request("/").upstream_headers();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| String::from_utf8_lossy(v).to_string())
        };
        assert_eq!(get("connection"), None);
        assert_eq!(get("host"), None);
        assert_eq!(get("accept").as_deref(), Some("text/plain"));
        assert_eq!(get("x-forwarded-for").as_deref(), Some("198.51.100.7, 10.0.0.1"));
        assert_eq!(get("x-forwarded-proto").as_deref(), Some("http"));
        assert_eq!(get("x-forwarded-host").as_deref(), Some("lb.example"));
        assert_eq!(get("x-request-id").as_deref(), Some("req-1"));
        assert_eq!(get("x-loadbalancer").as_deref(), Some(LOAD_BALANCER_ID));
    }

    #[actix_web::test]
    async fn test_forward_success() {
        let backend = spawn_backend();
        let pool = Arc::new(BackendPool::new(vec![BackendServer::new(backend.clone(), 1)]));
        let (forwarder, metrics) = forwarder(pool.clone(), 1_000);

        let outcome = forwarder
            .forward(&pool.servers()[0], request("/echo"))
            .await
            .unwrap();
        assert_eq!(outcome.status(), 200);
        assert_eq!(outcome.backend, backend);

        let body: Vec<u8> = outcome
            .into_body()
            .map(|chunk| chunk.unwrap().to_vec())
            .concat()
            .await;
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("x-forwarded-for=198.51.100.7, 10.0.0.1"));
        assert!(body.contains("x-request-id=req-1"));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.load_distribution[&backend], 1);
        assert_eq!(snapshot.server_failures[&backend], 0);
        assert_eq!(snapshot.response_times[&backend].count, 1);
    }

    #[actix_web::test]
    async fn test_server_error_counts_as_failure() {
        let backend = spawn_backend();
        let pool = Arc::new(BackendPool::new(vec![BackendServer::new(backend.clone(), 1)]));
        let (forwarder, metrics) = forwarder(pool.clone(), 1_000);

        let outcome = forwarder
            .forward(&pool.servers()[0], request("/fail"))
            .await
            .unwrap();
        assert_eq!(outcome.status(), 500);
        assert_eq!(metrics.snapshot().server_failures[&backend], 1);
        assert!(pool.servers()[0].is_healthy());
    }

    #[actix_web::test]
    async fn test_connection_refused_marks_unhealthy() {
        let pool = Arc::new(BackendPool::new(vec![BackendServer::new("http://127.0.0.1:1", 1)]));
        let (forwarder, metrics) = forwarder(pool.clone(), 1_000);

        let err = forwarder
            .forward(&pool.servers()[0], request("/"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Connect { .. }));
        assert_eq!(err.backend(), Some("http://127.0.0.1:1"));
        assert!(!pool.servers()[0].is_healthy());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.server_failures["http://127.0.0.1:1"], 1);
        assert!(snapshot.healthy_servers.is_empty());
    }

    #[actix_web::test]
    async fn test_timeout_marks_unhealthy() {
        let backend = spawn_backend();
        let pool = Arc::new(BackendPool::new(vec![BackendServer::new(backend, 1)]));
        let (forwarder, _) = forwarder(pool.clone(), 200);

        let err = forwarder
            .forward(&pool.servers()[0], request("/slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout { timeout_ms: 200, .. }));
        assert!(!pool.servers()[0].is_healthy());
    }

    #[actix_web::test]
    async fn test_abandoned_forward_counts_as_failure() {
        let backend = spawn_backend();
        let pool = Arc::new(BackendPool::new(vec![BackendServer::new(backend.clone(), 1)]));
        let (forwarder, metrics) = forwarder(pool.clone(), 5_000);

        let server = pool.servers()[0].clone();
        let forward = forwarder.forward(&server, request("/slow"));
        let _ = tokio::time::timeout(Duration::from_millis(100), forward).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.load_distribution[&backend], 1);
        assert_eq!(snapshot.server_failures[&backend], 1);
        assert!(pool.servers()[0].is_healthy());
    }
}
