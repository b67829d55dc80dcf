//! Synchronous reverse proxy: `/deploy/{id}/...` forwards to the engine host
//! at the deployment's mapped port, passing method, headers and body through
//! and stripping hop-by-hop headers on the way back. The upstream gets 30
//! seconds; redirects are handed back to the client untouched.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Path;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::Extension;
use hyper::client::HttpConnector;
use hyper::Client;
use once_cell::sync::Lazy;
use tracing::instrument;

use super::error::{Error, Result};
use super::ApiSettings;
use crate::persistence::Persistence;

static PROXY_CLIENT: Lazy<Client<HttpConnector>> = Lazy::new(Client::new);

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Response headers that must not be forwarded: the body is re-framed (and
/// already decoded) by the time it leaves here.
const STRIPPED_RESPONSE_HEADERS: [header::HeaderName; 4] = [
    header::CONTENT_ENCODING,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

pub async fn proxy_root(
    Extension(persistence): Extension<Persistence>,
    Extension(settings): Extension<ApiSettings>,
    Path(deployment_id): Path<String>,
    request: Request<Body>,
) -> Result<impl IntoResponse> {
    forward(persistence, settings, deployment_id, String::new(), request).await
}

pub async fn proxy_path(
    Extension(persistence): Extension<Persistence>,
    Extension(settings): Extension<ApiSettings>,
    Path((deployment_id, path)): Path<(String, String)>,
    request: Request<Body>,
) -> Result<impl IntoResponse> {
    forward(persistence, settings, deployment_id, path, request).await
}

#[instrument(skip_all, fields(%deployment_id, %path))]
async fn forward(
    persistence: Persistence,
    settings: ApiSettings,
    deployment_id: String,
    path: String,
    request: Request<Body>,
) -> Result<(StatusCode, HeaderMap, Vec<u8>)> {
    let deployment = persistence
        .get_deployment(&deployment_id)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::NotFound("Deployment not found".to_string()))?;

    let host_port = deployment
        .host_port
        .ok_or_else(|| Error::NotFound("Port not found for deployment".to_string()))?;

    let query = request
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let target = format!(
        "http://{}:{}/{}{}",
        settings.engine_host, host_port, path, query
    );

    let (parts, body) = request.into_parts();

    let mut upstream = Request::builder().method(parts.method).uri(&target);
    for (name, value) in &parts.headers {
        if name == header::HOST || name == header::CONNECTION {
            continue;
        }
        upstream = upstream.header(name, value);
    }
    let upstream = upstream
        .body(body)
        .map_err(|error| Error::ProxyFailed(error.to_string()))?;

    let response = match tokio::time::timeout(UPSTREAM_TIMEOUT, PROXY_CLIENT.request(upstream)).await
    {
        Err(_) => return Err(Error::ProxyTimeout),
        Ok(Err(error)) if error.is_connect() => return Err(Error::ProxyUnavailable),
        Ok(Err(error)) => return Err(Error::ProxyFailed(error.to_string())),
        Ok(Ok(response)) => response,
    };

    let (parts, body) = response.into_parts();
    let bytes = hyper::body::to_bytes(body)
        .await
        .map_err(|error| Error::ProxyFailed(error.to_string()))?;

    let mut headers = parts.headers;
    for name in STRIPPED_RESPONSE_HEADERS {
        headers.remove(name);
    }

    Ok((parts.status, headers, bytes.to_vec()))
}
