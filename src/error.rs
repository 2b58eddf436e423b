//! Errors surfaced to HTTP clients.

use actix_web::http::header::{self, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use chrono::Utc;
use log::debug;
use serde_json::json;
use thiserror::Error;

use crate::core::engine::ForwardError;
use crate::core::health::PoolError;
use crate::core::proxy::ProxyError;
use crate::core::routing::RoutingError;
use crate::models::{BlockReason, Decision};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Access denied")]
    Blocked(BlockReason),
    #[error("Challenge required")]
    Challenge(BlockReason),
    #[error("Too many requests - you are temporarily blocked")]
    RateLimited {
        retry_after_ms: u64,
        limit: u32,
        reason: BlockReason,
    },
    #[error("No healthy servers available")]
    NoHealthyServers,
    #[error("Bad gateway")]
    BadGateway { backend: Option<String> },
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
}

impl GatewayError {
    /// The rejection matching an admission decision, `None` if the request may proceed
    pub fn from_decision(decision: Decision, limit: u32) -> Option<Self> {
        match decision {
            Decision::Allow | Decision::Flagged(_) => None,
            Decision::Block(reason) => Some(GatewayError::Blocked(reason)),
            Decision::Challenge(reason) => Some(GatewayError::Challenge(reason)),
            Decision::RateLimited {
                retry_after_ms,
                reason,
            } => Some(GatewayError::RateLimited {
                retry_after_ms,
                limit,
                reason,
            }),
        }
    }
}

impl From<ForwardError> for GatewayError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::Routing(RoutingError::NoHealthyServers) => GatewayError::NoHealthyServers,
            ForwardError::Proxy(ProxyError::InvalidRequest(msg)) => GatewayError::BadRequest(msg),
            ForwardError::Proxy(e) => GatewayError::BadGateway {
                backend: e.backend().map(str::to_string),
            },
        }
    }
}

impl From<PoolError> for GatewayError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Duplicate(_) => GatewayError::Conflict(err.to_string()),
            PoolError::Invalid(_) => GatewayError::BadRequest(err.to_string()),
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Blocked(BlockReason::Manual | BlockReason::Geo) => StatusCode::FORBIDDEN,
            GatewayError::Blocked(_)
            | GatewayError::Challenge(_)
            | GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoHealthyServers => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());
        let body = match self {
            GatewayError::Blocked(reason) => json!({
                "error": self.to_string(),
                "reason": reason.as_str(),
            }),
            GatewayError::Challenge(reason) => json!({
                "error": self.to_string(),
                "reason": reason.as_str(),
                "challenge": true,
            }),
            GatewayError::RateLimited {
                retry_after_ms,
                limit,
                reason,
            } => {
                let reset = Utc::now() + chrono::Duration::milliseconds(*retry_after_ms as i64);
                response
                    .insert_header((header::RETRY_AFTER, (retry_after_ms + 999) / 1_000))
                    .insert_header(("X-RateLimit-Limit", *limit))
                    .insert_header(("X-RateLimit-Remaining", 0))
                    .insert_header(("X-RateLimit-Reset", reset.to_rfc3339()));
                json!({
                    "error": self.to_string(),
                    "reason": reason.as_str(),
                    "retryAfterMs": retry_after_ms,
                })
            }
            GatewayError::BadGateway {
                backend: Some(backend),
            } => {
                debug!("Answering 502 for backend {}", backend);
                json!({ "error": self.to_string() })
            }
            _ => json!({ "error": self.to_string() }),
        };
        response
            .insert_header((
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            ))
            .body(body.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_rate_limited_headers() {
        let err = GatewayError::RateLimited {
            retry_after_ms: 4_200,
            limit: 20,
            reason: BlockReason::RateLimit,
        };
        let response = err.error_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let headers = response.headers();
        assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "5");
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "20");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert!(headers.get("x-ratelimit-reset").is_some());

        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["reason"], "rate-limit");
        assert_eq!(json["retryAfterMs"], 4_200);
    }

    #[actix_web::test]
    async fn test_block_statuses() {
        assert_eq!(
            GatewayError::Blocked(BlockReason::Geo).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::Blocked(BlockReason::Pattern).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );

        let response = GatewayError::Challenge(BlockReason::Bot).error_response();
        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["challenge"], true);
        assert_eq!(json["reason"], "bot");
    }

    #[test]
    fn test_from_decision() {
        assert!(GatewayError::from_decision(Decision::Allow, 20).is_none());
        assert!(GatewayError::from_decision(Decision::Flagged(BlockReason::Bot), 20).is_none());
        assert!(matches!(
            GatewayError::from_decision(Decision::Block(BlockReason::Manual), 20),
            Some(GatewayError::Blocked(BlockReason::Manual))
        ));
    }

    #[test]
    fn test_forward_errors() {
        let err: GatewayError = ForwardError::Routing(RoutingError::NoHealthyServers).into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err: GatewayError = ForwardError::Proxy(ProxyError::Timeout {
            backend: "http://a".into(),
            timeout_ms: 10,
        })
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_pool_errors() {
        let err: GatewayError = PoolError::Duplicate("http://a".into()).into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        let err: GatewayError = PoolError::Invalid("weight".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayError::NotFound("Server not found".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
