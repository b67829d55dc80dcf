use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use super::rate_limit::Category;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    AuthRequired(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Rate limit exceeded")]
    RateLimited { category: Category, limit: u32 },
    #[error("Service timeout")]
    ProxyTimeout,
    #[error("Service unavailable")]
    ProxyUnavailable,
    #[error("Proxy error: {0}")]
    ProxyFailed(String),
    #[error(transparent)]
    Core(#[from] crate::error::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::BadRequest(message) => error_response(StatusCode::BAD_REQUEST, &message, "bad_request"),
            Error::AuthRequired(message) => {
                error_response(StatusCode::UNAUTHORIZED, &message, "auth_required")
            }
            Error::NotFound(message) => error_response(StatusCode::NOT_FOUND, &message, "not_found"),
            Error::RateLimited { category, limit } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "error": "Rate limit exceeded",
                        "message": "Too many requests. Please try again later.",
                        "limit_type": category.to_string(),
                    })),
                )
                    .into_response();
                let headers = response.headers_mut();
                headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
                response
            }
            Error::ProxyTimeout => {
                error_response(StatusCode::GATEWAY_TIMEOUT, "Service timeout", "proxy_timeout")
            }
            Error::ProxyUnavailable => error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable",
                "proxy_unavailable",
            ),
            Error::ProxyFailed(message) => {
                error_response(StatusCode::BAD_GATEWAY, &message, "proxy_failed")
            }
            Error::Core(source) => {
                error!(error = %source, "request had an error");
                let code = match source {
                    crate::error::Error::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                error_response(code, &source.to_string(), source.kind())
            }
            Error::Internal(source) => {
                error!(error = %source, "request had an error");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &source.to_string(),
                    "internal",
                )
            }
        }
    }
}

fn error_response(code: StatusCode, message: &str, kind: &str) -> Response {
    (
        code,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )],
        Json(json!({ "error": message, "type": kind })),
    )
        .into_response()
}

pub type Result<T> = std::result::Result<T, Error>;
