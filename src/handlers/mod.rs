pub mod auth;
mod error;
pub mod proxy;
pub mod rate_limit;

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::anyhow;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, Query};
use axum::headers::Cookie;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post, put};
use axum::{Extension, Json, Router, TypedHeader};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::detector::ProjectDetector;
use crate::engine::Engine;
use crate::logbus::{is_done_record, EventType, LogBus, LogEvent, MAX_EMPTY_READS, POLL_INTERVAL};
use crate::persistence::{
    CustomDomain, DeployConfig, Deployment, DeploymentKind, EnvVar, MetricSample, Persistence,
    Source, Status,
};
use crate::queue::{DeployJob, JobQueue};
use crate::recipe::PLATFORM_LABEL;
use crate::source::{clone_repo, extract_archive, sanitize_filename};

use auth::{session_from_cookie, Sessions, HTTP_CLIENT};
use rate_limit::{Category, RateLimiter};
pub use {self::error::Error, self::error::Result};

const MAX_UPLOAD_BYTES: usize = 600 * 1024 * 1024;

#[derive(Clone)]
pub struct ApiSettings {
    pub public_ip: String,
    pub engine_host: String,
    pub deployments_dir: PathBuf,
    pub uploads_dir: PathBuf,
}

pub fn make_router(
    persistence: Persistence,
    engine: Engine,
    bus: LogBus,
    queue: JobQueue,
    settings: ApiSettings,
    cors_origins: &str,
) -> Router {
    let origins: Vec<HeaderValue> = cors_origins
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    let api = Router::new()
        .route("/login/github", post(auth::github_login))
        .route("/logout/github", post(auth::github_logout))
        .route("/check-github-session", get(auth::check_github_session))
        .route("/user/repos", get(auth::list_repos))
        .route("/health", get(health))
        .route("/detect-project", post(detect_project))
        .route("/detect-github", post(detect_github))
        .route("/deploy-stream", post(deploy_stream))
        .route("/deploy-local", post(deploy_local))
        .route("/deployments", get(get_deployments))
        .route(
            "/deployments/:deployment_id",
            get(get_deployment).delete(delete_deployment),
        )
        .route("/deployments/:deployment_id/stream", get(stream_logs))
        .route("/deployments/:deployment_id/logs", get(get_logs))
        .route("/deployments/:deployment_id/restart", post(restart_deployment))
        .route("/deployments/:deployment_id/stats", get(get_stats))
        .route("/deployments/:deployment_id/metrics", get(get_metrics))
        .route("/deployments/:deployment_id/rollback", post(rollback_deployment))
        .route("/deployments/:deployment_id/env", put(update_env))
        .route("/deployments/:deployment_id/domain", post(add_custom_domain))
        .route("/cleanup", post(cleanup_stopped));

    Router::new()
        .nest("/api", api)
        .route("/deploy/:deployment_id", any(proxy::proxy_root))
        .route("/deploy/:deployment_id/", any(proxy::proxy_root))
        .route("/deploy/:deployment_id/*path", any(proxy::proxy_path))
        .layer(Extension(persistence))
        .layer(Extension(engine))
        .layer(Extension(bus))
        .layer(Extension(queue))
        .layer(Extension(settings))
        .layer(Extension(Sessions::default()))
        .layer(Extension(RateLimiter::default()))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn platform_label() -> String {
    format!("{}={}", PLATFORM_LABEL.0, PLATFORM_LABEL.1)
}

// ---------------------------------------------------------------------------
// Health and detection

async fn health(
    Extension(engine): Extension<Engine>,
    Extension(bus): Extension<LogBus>,
    Extension(queue): Extension<JobQueue>,
    Extension(persistence): Extension<Persistence>,
) -> impl IntoResponse {
    let docker_healthy = engine.ping().await;
    let redis_healthy = bus.ping().await;
    let queue_length = if redis_healthy {
        queue.len().await.unwrap_or(0)
    } else {
        0
    };

    let healthy = docker_healthy && redis_healthy;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "docker": if docker_healthy { "connected" } else { "disconnected" },
            "redis": if redis_healthy { "connected" } else { "disconnected" },
            "database": persistence.dialect(),
            "timestamp": Utc::now(),
            "queue_length": queue_length,
        })),
    )
}

#[instrument(skip_all)]
async fn detect_project(
    Extension(settings): Extension<ApiSettings>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    let (file, _fields) = parse_upload(multipart).await?;
    let file = file.ok_or_else(|| Error::BadRequest("No file provided".to_string()))?;
    if !file.filename.ends_with(".zip") {
        return Err(Error::BadRequest("Only .zip files supported".to_string()));
    }

    let temp_dir = settings.uploads_dir.join(format!("temp-{}", short_id()));
    tokio::fs::create_dir_all(&temp_dir)
        .await
        .map_err(crate::error::Error::from)?;
    let archive_path = temp_dir.join(&file.filename);
    tokio::fs::write(&archive_path, &file.bytes)
        .await
        .map_err(crate::error::Error::from)?;

    let extract_dir = temp_dir.join("extracted");
    let detected = {
        let archive_path = archive_path.clone();
        let extract_dir = extract_dir.clone();
        tokio::task::spawn_blocking(move || -> crate::error::Result<_> {
            extract_archive(&archive_path, &extract_dir)?;
            let detector = ProjectDetector::new(&extract_dir);
            Ok((detector.detect(), detector.suggestions()))
        })
        .await
        .map_err(|join_error| Error::Internal(anyhow!(join_error)))?
    };

    let _ = tokio::fs::remove_dir_all(&temp_dir).await;
    let (detection, suggestions) = detected.map_err(Error::from)?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Detected {}", suggestions.detected),
        "detection": detection,
        "suggestions": suggestions,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectGithubRequest {
    github_repo: Option<String>,
    branch: Option<String>,
}

#[instrument(skip_all)]
async fn detect_github(
    Extension(settings): Extension<ApiSettings>,
    Extension(sessions): Extension<Sessions>,
    cookie: Option<TypedHeader<Cookie>>,
    Json(request): Json<DetectGithubRequest>,
) -> Result<Json<Value>> {
    let repo = request
        .github_repo
        .filter(|repo| !repo.trim().is_empty())
        .ok_or_else(|| Error::BadRequest("GitHub repository URL required".to_string()))?;
    let branch = request.branch.unwrap_or_else(|| "main".to_string());
    let token = session_from_cookie(&sessions, cookie.as_ref()).map(|session| session.token);

    let temp_dir = settings.uploads_dir.join(format!("temp-{}", short_id()));
    let cloned = clone_repo(&repo, &temp_dir, &branch, token.as_deref()).await;
    if let Err(error) = cloned {
        let _ = tokio::fs::remove_dir_all(&temp_dir).await;
        return Err(error.into());
    }

    let detected = {
        let temp_dir = temp_dir.clone();
        tokio::task::spawn_blocking(move || {
            let detector = ProjectDetector::new(&temp_dir);
            (detector.detect(), detector.suggestions())
        })
        .await
        .map_err(|join_error| Error::Internal(anyhow!(join_error)))?
    };

    let _ = tokio::fs::remove_dir_all(&temp_dir).await;
    let (detection, suggestions) = detected;

    Ok(Json(json!({
        "success": true,
        "message": format!("Detected {}", suggestions.detected),
        "detection": detection,
        "suggestions": suggestions,
    })))
}

// ---------------------------------------------------------------------------
// Submitting deployments

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployStreamRequest {
    project_name: Option<String>,
    github_repo: Option<String>,
    branch: Option<String>,
    deployment_type: DeploymentKind,
    #[serde(default)]
    config: DeployConfig,
    #[serde(default)]
    environment_variables: Vec<EnvVar>,
    #[serde(default)]
    persistent_storage: bool,
    health_check_path: Option<String>,
    auto_restart: Option<bool>,
    /// Present on redeploys of an existing deployment.
    deployment_id: Option<String>,
}

/// Accepts a remote-repository deployment and answers with an SSE stream that
/// follows it through clone, queueing and the whole build, ending on the
/// terminal `done` frame.
#[instrument(skip_all)]
async fn deploy_stream(
    Extension(persistence): Extension<Persistence>,
    Extension(queue): Extension<JobQueue>,
    Extension(bus): Extension<LogBus>,
    Extension(sessions): Extension<Sessions>,
    Extension(limiter): Extension<RateLimiter>,
    Extension(settings): Extension<ApiSettings>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    cookie: Option<TypedHeader<Cookie>>,
    Json(request): Json<DeployStreamRequest>,
) -> Result<Response> {
    let quota = limiter.check(Category::Deploy, addr.ip())?;

    let project_name = request
        .project_name
        .clone()
        .filter(|name| !name.trim().is_empty());
    let github_repo = request
        .github_repo
        .clone()
        .filter(|repo| !repo.trim().is_empty());
    let (Some(project_name), Some(github_repo)) = (project_name, github_repo) else {
        return Err(Error::BadRequest(
            "Project name and repository required".to_string(),
        ));
    };

    let token = session_from_cookie(&sessions, cookie.as_ref()).map(|session| session.token);

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(run_deploy_stream(
        persistence,
        queue,
        bus,
        settings,
        request,
        project_name,
        github_repo,
        token,
        tx,
    ));

    Ok((quota, sse_response(rx)).into_response())
}

#[allow(clippy::too_many_arguments)]
async fn run_deploy_stream(
    persistence: Persistence,
    queue: JobQueue,
    bus: LogBus,
    settings: ApiSettings,
    request: DeployStreamRequest,
    project_name: String,
    github_repo: String,
    token: Option<String>,
    tx: mpsc::Sender<Event>,
) {
    let deployment_id = request
        .deployment_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(short_id);
    let branch = request.branch.clone().unwrap_or_else(|| "main".to_string());
    let project_dir = settings.deployments_dir.join(&deployment_id);

    send_event(
        &tx,
        &LogEvent::message(
            EventType::Info,
            format!("Queuing deployment {deployment_id}"),
        ),
    )
    .await;

    let mut config = request.config;
    config.environment_variables = request.environment_variables;
    config.persistent_storage = request.persistent_storage;
    config.health_check_path = Some(request.health_check_path.unwrap_or_else(|| "/".to_string()));
    config.auto_restart = request.auto_restart.unwrap_or(true);
    if config.persistent_storage && config.volume_name.is_none() {
        config.volume_name = Some(format!("persistent_data_{deployment_id}"));
    }

    // The record exists (queued) before the clone starts; a clone failure
    // leaves it behind in that state.
    let existing = persistence
        .get_deployment(&deployment_id)
        .await
        .ok()
        .flatten();
    let record = Deployment {
        id: deployment_id.clone(),
        project_name,
        deployment_type: request.deployment_type,
        status: Status::Queued,
        url: format!("/deploy/{deployment_id}/"),
        direct_url: existing.as_ref().and_then(|d| d.direct_url.clone()),
        timestamp: Utc::now(),
        container_id: existing.as_ref().and_then(|d| d.container_id.clone()),
        host_port: existing.as_ref().and_then(|d| d.host_port),
        source: Source::RemoteRepo,
        repo: Some(github_repo.clone()),
        branch: Some(branch.clone()),
        filename: None,
        config: config.clone(),
        environment_variables: config.environment_variables.clone(),
        version: existing.as_ref().map(|d| d.version).unwrap_or(1),
        custom_domain: existing.as_ref().and_then(|d| d.custom_domain.clone()),
        volume_path: config.volume_name.clone(),
    };
    if let Err(error) = persistence.save_deployment(&record).await {
        send_event(
            &tx,
            &LogEvent::message(EventType::Error, format!("Server Error: {error}")),
        )
        .await;
        return;
    }

    send_event(
        &tx,
        &LogEvent::message(EventType::Info, "Cloning repository..."),
    )
    .await;

    if let Err(error) = clone_repo(&github_repo, &project_dir, &branch, token.as_deref()).await {
        let _ = tokio::fs::remove_dir_all(&project_dir).await;
        let message = if error.to_string().to_lowercase().contains("authentication") {
            "Authentication failed. Check your GitHub token.".to_string()
        } else {
            error.to_string()
        };
        send_event(&tx, &LogEvent::message(EventType::Error, message.clone())).await;
        send_event(&tx, &LogEvent::done_failure(message)).await;
        return;
    }

    let version = match persistence.next_version(&deployment_id).await {
        Ok(version) => version,
        Err(error) => {
            send_event(
                &tx,
                &LogEvent::message(EventType::Error, format!("Server Error: {error}")),
            )
            .await;
            return;
        }
    };

    let job = DeployJob {
        deployment_id: deployment_id.clone(),
        project_dir,
        deployment_type: request.deployment_type,
        config,
        version,
    };
    match queue.enqueue(&job).await {
        Ok(position) => {
            send_event(
                &tx,
                &LogEvent::message(EventType::Info, format!("Job queued. Position: {position}")),
            )
            .await;
        }
        Err(error) => {
            send_event(
                &tx,
                &LogEvent::message(EventType::Error, format!("Failed to queue: {error}")),
            )
            .await;
            return;
        }
    }

    tail_log_bus(bus, deployment_id, tx).await;
}

/// Accepts an uploaded archive, extracts it into the build context, enqueues
/// the job, and answers synchronously with the queued record.
#[instrument(skip_all)]
async fn deploy_local(
    Extension(persistence): Extension<Persistence>,
    Extension(queue): Extension<JobQueue>,
    Extension(limiter): Extension<RateLimiter>,
    Extension(settings): Extension<ApiSettings>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    multipart: Multipart,
) -> Result<impl IntoResponse> {
    let quota = limiter.check(Category::Upload, addr.ip())?;

    let (file, fields) = parse_upload(multipart).await?;
    let file = file.ok_or_else(|| Error::BadRequest("No file provided".to_string()))?;
    if !file.filename.ends_with(".zip") {
        return Err(Error::BadRequest("Only .zip files supported".to_string()));
    }

    let project_name = fields
        .get("projectName")
        .filter(|name| !name.trim().is_empty())
        .cloned()
        .ok_or_else(|| Error::BadRequest("Project name required".to_string()))?;
    let deployment_type: DeploymentKind = fields
        .get("deploymentType")
        .and_then(|kind| kind.parse().ok())
        .ok_or_else(|| Error::BadRequest("Deployment type required".to_string()))?;

    let mut config: DeployConfig = match fields.get("config") {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|error| Error::BadRequest(format!("Invalid config: {error}")))?,
        None => DeployConfig::default(),
    };
    config.environment_variables = match fields.get("environmentVariables") {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|error| Error::BadRequest(format!("Invalid environment variables: {error}")))?,
        None => Vec::new(),
    };
    config.persistent_storage = fields
        .get("persistentStorage")
        .map(|flag| flag.to_lowercase() == "true")
        .unwrap_or(false);
    config.health_check_path = Some(
        fields
            .get("healthCheckPath")
            .cloned()
            .unwrap_or_else(|| "/".to_string()),
    );
    config.auto_restart = fields
        .get("autoRestart")
        .map(|flag| flag.to_lowercase() == "true")
        .unwrap_or(true);

    let deployment_id = fields
        .get("deploymentId")
        .filter(|id| !id.is_empty())
        .cloned()
        .unwrap_or_else(short_id);
    if config.persistent_storage && config.volume_name.is_none() {
        config.volume_name = Some(format!("persistent_data_{deployment_id}"));
    }

    // Stash the archive, extract it into the build context, drop the upload.
    let upload_dir = settings.uploads_dir.join(&deployment_id);
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .map_err(crate::error::Error::from)?;
    let archive_path = upload_dir.join(&file.filename);
    tokio::fs::write(&archive_path, &file.bytes)
        .await
        .map_err(crate::error::Error::from)?;

    let project_dir = settings.deployments_dir.join(&deployment_id);
    if project_dir.exists() {
        tokio::fs::remove_dir_all(&project_dir)
            .await
            .map_err(crate::error::Error::from)?;
    }
    {
        let archive_path = archive_path.clone();
        let project_dir = project_dir.clone();
        tokio::task::spawn_blocking(move || extract_archive(&archive_path, &project_dir))
            .await
            .map_err(|join_error| Error::Internal(anyhow!(join_error)))?
            .map_err(Error::from)?;
    }

    let existing = persistence
        .get_deployment(&deployment_id)
        .await
        .map_err(Error::from)?;
    let record = Deployment {
        id: deployment_id.clone(),
        project_name,
        deployment_type,
        status: Status::Queued,
        url: format!("/deploy/{deployment_id}/"),
        direct_url: existing.as_ref().and_then(|d| d.direct_url.clone()),
        timestamp: Utc::now(),
        container_id: existing.as_ref().and_then(|d| d.container_id.clone()),
        host_port: existing.as_ref().and_then(|d| d.host_port),
        source: Source::UploadedArchive,
        repo: None,
        branch: None,
        filename: Some(file.filename.clone()),
        config: config.clone(),
        environment_variables: config.environment_variables.clone(),
        version: existing.as_ref().map(|d| d.version).unwrap_or(1),
        custom_domain: existing.as_ref().and_then(|d| d.custom_domain.clone()),
        volume_path: config.volume_name.clone(),
    };
    persistence
        .save_deployment(&record)
        .await
        .map_err(Error::from)?;

    let version = persistence
        .next_version(&deployment_id)
        .await
        .map_err(Error::from)?;
    queue
        .enqueue(&DeployJob {
            deployment_id: deployment_id.clone(),
            project_dir,
            deployment_type,
            config,
            version,
        })
        .await
        .map_err(Error::from)?;

    let _ = tokio::fs::remove_dir_all(&upload_dir).await;

    info!(deployment_id, "archive deployment queued");
    Ok((quota, Json(record)))
}

// ---------------------------------------------------------------------------
// Reading and managing deployments

#[instrument(skip_all)]
async fn get_deployments(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Extension(limiter): Extension<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<impl IntoResponse> {
    let quota = limiter.check(Category::Api, addr.ip())?;

    let mut deployments = persistence
        .get_all_deployments()
        .await
        .map_err(Error::from)?;
    for deployment in &mut deployments {
        reconcile_status(&persistence, &engine, deployment).await;
    }

    Ok((quota, Json(deployments)))
}

#[instrument(skip_all, fields(%deployment_id))]
async fn get_deployment(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Extension(limiter): Extension<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse> {
    let quota = limiter.check(Category::Api, addr.ip())?;

    let mut deployment = persistence
        .get_deployment(&deployment_id)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::NotFound("Deployment not found".to_string()))?;
    reconcile_status(&persistence, &engine, &mut deployment).await;

    let versions = persistence
        .get_versions(&deployment_id)
        .await
        .map_err(Error::from)?;

    let mut body = serde_json::to_value(&deployment)
        .map_err(|error| Error::Core(crate::error::Error::from(error)))?;
    body["versions"] =
        serde_json::to_value(&versions).map_err(|error| Error::Core(crate::error::Error::from(error)))?;

    Ok((quota, Json(body)))
}

/// Cascade delete: the active container, every versioned container, anything
/// else still wearing the deployment's label, the named volume, then the
/// rows.
#[instrument(skip_all, fields(%deployment_id))]
async fn delete_deployment(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Extension(limiter): Extension<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse> {
    let quota = limiter.check(Category::Api, addr.ip())?;

    let deployment = persistence
        .get_deployment(&deployment_id)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::NotFound("Deployment not found".to_string()))?;

    if let Some(container_id) = &deployment.container_id {
        engine.stop_and_remove(container_id).await;
    }

    if let Ok(versions) = persistence.get_versions(&deployment_id).await {
        for version in versions {
            if let Some(container_id) = version.container_id {
                engine.stop_and_remove(&container_id).await;
            }
        }
    }

    // Sweep stragglers by label so nothing tagged with this deployment
    // survives.
    if let Ok(containers) = engine
        .list(&format!("deployment_id={deployment_id}"))
        .await
    {
        for container in containers {
            if let Some(id) = container.id {
                engine.stop_and_remove(&id).await;
            }
        }
    }

    if let Some(volume) = &deployment.volume_path {
        if let Err(error) = engine.remove_volume(volume).await {
            warn!(%error, %volume, "failed to remove volume");
        }
    }

    persistence
        .delete_deployment(&deployment_id)
        .await
        .map_err(Error::from)?;

    Ok((quota, Json(json!({ "message": "Deployment deleted successfully" }))))
}

#[derive(Deserialize)]
struct LogsQuery {
    tail: Option<u32>,
}

#[instrument(skip_all, fields(%deployment_id))]
async fn get_logs(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Extension(bus): Extension<LogBus>,
    Extension(limiter): Extension<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(deployment_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse> {
    let quota = limiter.check(Category::Api, addr.ip())?;

    let deployment = persistence
        .get_deployment(&deployment_id)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::NotFound("Deployment not found".to_string()))?;

    // While the deployment is in flight only the log bus has anything to say.
    if deployment.status.is_in_flight() {
        let messages = bus.messages(&deployment_id).await.map_err(Error::from)?;
        return Ok((quota, Json(json!({ "logs": messages.join("\n") }))));
    }

    let logs = match &deployment.container_id {
        Some(container_id) => engine
            .logs(container_id, query.tail.unwrap_or(100))
            .await
            .map_err(Error::from)?,
        None => String::new(),
    };

    Ok((quota, Json(json!({ "logs": logs }))))
}

async fn stream_logs(
    Extension(bus): Extension<LogBus>,
    Path(deployment_id): Path<String>,
) -> Response {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        send_event(
            &tx,
            &LogEvent::message(
                EventType::Info,
                format!("Attached to log stream for {deployment_id}"),
            ),
        )
        .await;
        tail_log_bus(bus, deployment_id, tx).await;
    });

    sse_response(rx)
}

#[instrument(skip_all, fields(%deployment_id))]
async fn restart_deployment(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Extension(limiter): Extension<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse> {
    let quota = limiter.check(Category::Api, addr.ip())?;

    let deployment = persistence
        .get_deployment(&deployment_id)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::NotFound("Deployment not found".to_string()))?;
    let container_id = deployment
        .container_id
        .ok_or_else(|| Error::NotFound("No container for deployment".to_string()))?;

    engine.restart(&container_id, 10).await.map_err(Error::from)?;

    Ok((
        quota,
        Json(json!({ "message": "Deployment restarted successfully" })),
    ))
}

#[instrument(skip_all, fields(%deployment_id))]
async fn get_stats(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Extension(limiter): Extension<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse> {
    let quota = limiter.check(Category::Api, addr.ip())?;

    let deployment = persistence
        .get_deployment(&deployment_id)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::NotFound("Deployment not found".to_string()))?;
    let container_id = deployment
        .container_id
        .ok_or_else(|| Error::NotFound("No container for deployment".to_string()))?;

    let stats = engine.stats(&container_id).await.map_err(Error::from)?;

    let sample = MetricSample::derive(&stats);
    if let Err(error) = persistence.insert_metric(&deployment_id, &sample).await {
        warn!(%error, %deployment_id, "failed to record metric sample");
    }

    let body = serde_json::to_value(&stats)
        .map_err(|error| Error::Core(crate::error::Error::from(error)))?;
    Ok((quota, Json(body)))
}

#[derive(Deserialize)]
struct MetricsQuery {
    hours: Option<i64>,
}

#[instrument(skip_all, fields(%deployment_id))]
async fn get_metrics(
    Extension(persistence): Extension<Persistence>,
    Extension(limiter): Extension<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(deployment_id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Result<impl IntoResponse> {
    let quota = limiter.check(Category::Api, addr.ip())?;

    let metrics = persistence
        .get_metrics(&deployment_id, query.hours.unwrap_or(24).max(1))
        .await
        .map_err(Error::from)?;

    Ok((quota, Json(json!({ "metrics": metrics }))))
}

#[derive(Deserialize, Default)]
struct RollbackRequest {
    version: Option<i64>,
}

/// Reactivates a previously rolled-out container: stop the current one,
/// start the target version's container, swap the record over. No rebuild
/// happens; when the target container cannot start the error surfaces and
/// the record stays as the engine left things.
#[instrument(skip_all, fields(%deployment_id))]
async fn rollback_deployment(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Extension(settings): Extension<ApiSettings>,
    Extension(limiter): Extension<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(deployment_id): Path<String>,
    body: Option<Json<RollbackRequest>>,
) -> Result<impl IntoResponse> {
    let quota = limiter.check(Category::Api, addr.ip())?;

    let mut deployment = persistence
        .get_deployment(&deployment_id)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::NotFound("Deployment not found".to_string()))?;

    let versions = persistence
        .get_versions(&deployment_id)
        .await
        .map_err(Error::from)?;
    let requested = body.and_then(|Json(request)| request.version);

    let target = match requested {
        Some(version) => versions
            .iter()
            .find(|candidate| candidate.version == version)
            .ok_or_else(|| Error::NotFound(format!("Version {version} not found")))?,
        None => versions
            .iter()
            .filter(|candidate| candidate.version != deployment.version)
            .max_by_key(|candidate| candidate.version)
            .ok_or_else(|| {
                Error::BadRequest("No previous versions available".to_string())
            })?,
    };
    let target_container = target
        .container_id
        .clone()
        .ok_or_else(|| {
            Error::Core(crate::error::Error::Rollback(format!(
                "version {} has no container to reactivate",
                target.version
            )))
        })?;

    if let Some(current) = &deployment.container_id {
        if let Err(error) = engine.stop(current, 10).await {
            warn!(%error, "failed to stop the active container");
        }
    }

    engine.start(&target_container).await.map_err(|error| {
        Error::Core(crate::error::Error::Rollback(error.to_string()))
    })?;

    deployment.container_id = Some(target_container.clone());
    deployment.config = target.config.clone();
    deployment.version = target.version;
    deployment.timestamp = Utc::now();
    deployment.status = Status::Active;

    // A restarted container lands on a fresh ephemeral port.
    if let Ok(Some(port)) = engine.first_host_port(&target_container).await {
        deployment.host_port = Some(port);
        deployment.direct_url = Some(format!("http://{}:{}", settings.public_ip, port));
    }

    persistence
        .save_deployment(&deployment)
        .await
        .map_err(Error::from)?;

    Ok((
        quota,
        Json(json!({
            "message": format!("Rolled back to version {}", deployment.version),
            "deployment": deployment,
        })),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvUpdateRequest {
    #[serde(default)]
    environment_variables: Vec<EnvVar>,
}

#[instrument(skip_all, fields(%deployment_id))]
async fn update_env(
    Extension(persistence): Extension<Persistence>,
    Extension(engine): Extension<Engine>,
    Extension(limiter): Extension<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(deployment_id): Path<String>,
    Json(request): Json<EnvUpdateRequest>,
) -> Result<impl IntoResponse> {
    let quota = limiter.check(Category::Api, addr.ip())?;

    let mut deployment = persistence
        .get_deployment(&deployment_id)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::NotFound("Deployment not found".to_string()))?;

    deployment.config.environment_variables = request.environment_variables.clone();
    deployment.environment_variables = request.environment_variables;
    persistence
        .save_deployment(&deployment)
        .await
        .map_err(Error::from)?;

    if let Some(container_id) = &deployment.container_id {
        engine.restart(container_id, 10).await.map_err(Error::from)?;
    }

    Ok((
        quota,
        Json(json!({
            "message": "Environment variables updated (container restarted)",
            "deployment": deployment,
        })),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DomainRequest {
    domain: Option<String>,
    cloudflare_api_key: Option<String>,
    cloudflare_zone_id: Option<String>,
}

/// One-shot Cloudflare DNS record creation; not part of the deployment
/// pipeline, just recorded on success.
#[instrument(skip_all, fields(%deployment_id))]
async fn add_custom_domain(
    Extension(persistence): Extension<Persistence>,
    Extension(limiter): Extension<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(deployment_id): Path<String>,
    Json(request): Json<DomainRequest>,
) -> Result<impl IntoResponse> {
    let quota = limiter.check(Category::Api, addr.ip())?;

    let mut deployment = persistence
        .get_deployment(&deployment_id)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::NotFound("Deployment not found".to_string()))?;

    let (Some(domain), Some(api_key), Some(zone_id)) = (
        request.domain.filter(|d| !d.is_empty()),
        request.cloudflare_api_key.filter(|k| !k.is_empty()),
        request.cloudflare_zone_id.filter(|z| !z.is_empty()),
    ) else {
        return Err(Error::BadRequest(
            "Domain, API key, and Zone ID required".to_string(),
        ));
    };

    let response = HTTP_CLIENT
        .post(format!(
            "https://api.cloudflare.com/client/v4/zones/{zone_id}/dns_records"
        ))
        .bearer_auth(&api_key)
        .json(&json!({
            "type": "A",
            "name": domain,
            "content": "127.0.0.1",
            "ttl": 1,
            "proxied": true,
        }))
        .send()
        .await
        .map_err(|error| Error::Internal(anyhow!("Cloudflare API error: {error}")))?;

    if !response.status().is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::Internal(anyhow!("Cloudflare API error: {text}")));
    }

    deployment.custom_domain = Some(CustomDomain {
        domain: domain.clone(),
        status: "active".to_string(),
    });
    persistence
        .save_deployment(&deployment)
        .await
        .map_err(Error::from)?;
    persistence
        .insert_custom_domain(&deployment_id, &domain, &zone_id)
        .await
        .map_err(Error::from)?;

    Ok((
        quota,
        Json(json!({
            "message": format!("Custom domain {domain} added"),
            "deployment": deployment,
        })),
    ))
}

async fn cleanup_stopped(Extension(engine): Extension<Engine>) -> Result<Json<Value>> {
    let removed = engine
        .prune_exited(&platform_label())
        .await
        .map_err(Error::from)?;
    Ok(Json(json!({
        "message": format!("Removed {removed} stopped containers")
    })))
}

// ---------------------------------------------------------------------------
// Shared plumbing

/// Aligns a record's status with what the engine reports for its container.
/// In-flight states are left alone (the container is not authoritative yet),
/// and so is a record whose container has vanished.
async fn reconcile_status(persistence: &Persistence, engine: &Engine, deployment: &mut Deployment) {
    if deployment.status.is_in_flight() {
        return;
    }
    let Some(container_id) = &deployment.container_id else {
        return;
    };

    match engine.status(container_id).await {
        Ok(Some(state)) => {
            let observed = if state == "running" {
                Status::Active
            } else {
                Status::Stopped
            };
            if observed != deployment.status {
                deployment.status = observed;
                if let Err(error) = persistence.save_deployment(deployment).await {
                    warn!(%error, deployment_id = %deployment.id, "failed to persist reconciled status");
                }
            }
        }
        Ok(None) => {}
        Err(error) => warn!(%error, "failed to inspect container during reconcile"),
    }
}

struct UploadedArchive {
    bytes: Bytes,
    filename: String,
}

async fn parse_upload(
    mut multipart: Multipart,
) -> Result<(Option<UploadedArchive>, HashMap<String, String>)> {
    let mut file = None;
    let mut fields = HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| Error::BadRequest(error.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let filename = sanitize_filename(field.file_name().unwrap_or("upload.zip"));
            let bytes = field
                .bytes()
                .await
                .map_err(|error| Error::BadRequest(error.to_string()))?;
            file = Some(UploadedArchive { bytes, filename });
        } else if !name.is_empty() {
            let value = field
                .text()
                .await
                .map_err(|error| Error::BadRequest(error.to_string()))?;
            fields.insert(name, value);
        }
    }

    Ok((file, fields))
}

async fn send_event(tx: &mpsc::Sender<Event>, event: &LogEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(raw) => tx.send(Event::default().data(raw)).await.is_ok(),
        Err(_) => false,
    }
}

/// Follows the log bus from offset 0, forwarding each raw record as one SSE
/// frame. Ends on the terminal `done` record, on client disconnect, or after
/// twenty minutes of silence (which the client sees as an error frame).
async fn tail_log_bus(bus: LogBus, deployment_id: String, tx: mpsc::Sender<Event>) {
    let mut offset = 0usize;
    let mut empty_reads = 0u32;

    loop {
        let records = match bus.range(&deployment_id, offset).await {
            Ok(records) => records,
            Err(error) => {
                warn!(%error, deployment_id, "log bus read failed");
                Vec::new()
            }
        };

        if records.is_empty() {
            empty_reads += 1;
            if empty_reads > MAX_EMPTY_READS {
                send_event(
                    &tx,
                    &LogEvent::message(EventType::Error, "Timeout waiting for logs"),
                )
                .await;
                return;
            }
            sleep(POLL_INTERVAL).await;
            continue;
        }

        empty_reads = 0;
        for raw in records {
            offset += 1;
            let done = is_done_record(&raw);
            if tx.send(Event::default().data(raw)).await.is_err() {
                return;
            }
            if done {
                return;
            }
        }
    }
}

fn sse_response(rx: mpsc::Receiver<Event>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Sse::new(stream).into_response();

    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_are_short_and_unique() {
        let a = short_id();
        let b = short_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn platform_label_matches_recipe_labels() {
        assert_eq!(platform_label(), "app=deployment-platform");
    }
}
