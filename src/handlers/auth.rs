//! GitHub session endpoints. A personal-access token is validated against
//! the GitHub API, stored in an in-memory session, and referenced by an
//! opaque cookie. Workers never see the token; it only feeds private clones
//! issued by the control plane.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::headers::Cookie;
use axum::http::header::SET_COOKIE;
use axum::response::AppendHeaders;
use axum::{Extension, Json, TypedHeader};
use once_cell::sync::Lazy;
use rand::distributions::{Alphanumeric, DistString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::error::{Error, Result};

pub const SESSION_COOKIE: &str = "slipway_session";

pub static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent(concat!("slipway/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("a default tls client always builds")
});

#[derive(Clone)]
pub struct GithubSession {
    pub token: String,
    pub username: String,
}

#[derive(Clone, Default)]
pub struct Sessions {
    inner: Arc<RwLock<HashMap<String, GithubSession>>>,
}

impl Sessions {
    pub fn create(&self, token: String, username: String) -> String {
        let id = Alphanumeric.sample_string(&mut rand::thread_rng(), 32);
        self.inner
            .write()
            .expect("session lock poisoned")
            .insert(id.clone(), GithubSession { token, username });
        id
    }

    pub fn get(&self, id: &str) -> Option<GithubSession> {
        self.inner
            .read()
            .expect("session lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) {
        self.inner
            .write()
            .expect("session lock poisoned")
            .remove(id);
    }
}

pub fn session_from_cookie(
    sessions: &Sessions,
    cookie: Option<&TypedHeader<Cookie>>,
) -> Option<GithubSession> {
    let id = cookie?.get(SESSION_COOKIE)?;
    sessions.get(id)
}

#[derive(Deserialize)]
struct LoginRequest {
    token: Option<String>,
}

pub async fn github_login(
    Extension(sessions): Extension<Sessions>,
    Json(request): Json<Value>,
) -> Result<impl axum::response::IntoResponse> {
    let request: LoginRequest =
        serde_json::from_value(request).map_err(|_| Error::BadRequest("Token required".into()))?;
    let token = request
        .token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| Error::BadRequest("Token required".to_string()))?;

    let username = validate_token(&token).await?;
    info!(username, "github login successful");

    let session_id = sessions.create(token, username.clone());
    let cookie = format!("{SESSION_COOKIE}={session_id}; HttpOnly; Path=/; Max-Age=604800");

    Ok((
        AppendHeaders([(SET_COOKIE, cookie)]),
        Json(json!({ "message": "Login successful", "username": username })),
    ))
}

pub async fn github_logout(
    Extension(sessions): Extension<Sessions>,
    cookie: Option<TypedHeader<Cookie>>,
) -> impl axum::response::IntoResponse {
    if let Some(id) = cookie.as_ref().and_then(|c| c.get(SESSION_COOKIE)) {
        sessions.remove(id);
    }

    let expired = format!("{SESSION_COOKIE}=; HttpOnly; Path=/; Max-Age=0");
    (
        AppendHeaders([(SET_COOKIE, expired)]),
        Json(json!({ "message": "Logged out" })),
    )
}

pub async fn check_github_session(
    Extension(sessions): Extension<Sessions>,
    cookie: Option<TypedHeader<Cookie>>,
) -> Json<Value> {
    let Some(session) = session_from_cookie(&sessions, cookie.as_ref()) else {
        return Json(json!({ "authenticated": false }));
    };

    match validate_token(&session.token).await {
        Ok(username) => Json(json!({ "authenticated": true, "username": username })),
        Err(_) => {
            if let Some(id) = cookie.as_ref().and_then(|c| c.get(SESSION_COOKIE)) {
                sessions.remove(id);
            }
            Json(json!({ "authenticated": false }))
        }
    }
}

pub async fn list_repos(
    Extension(sessions): Extension<Sessions>,
    cookie: Option<TypedHeader<Cookie>>,
) -> Result<Json<Value>> {
    let session = session_from_cookie(&sessions, cookie.as_ref())
        .ok_or_else(|| Error::AuthRequired("Not authenticated".to_string()))?;

    let response = HTTP_CLIENT
        .get("https://api.github.com/user/repos?per_page=100&sort=updated")
        .header("authorization", format!("token {}", session.token))
        .send()
        .await
        .map_err(|error| Error::Internal(anyhow::anyhow!("Failed to fetch repositories: {error}")))?;

    if !response.status().is_success() {
        return Err(Error::Internal(anyhow::anyhow!(
            "Failed to fetch repositories"
        )));
    }

    let repos: Vec<Value> = response
        .json()
        .await
        .map_err(|error| Error::Internal(anyhow::anyhow!("Failed to fetch repositories: {error}")))?;

    let repositories: Vec<Value> = repos
        .iter()
        .map(|repo| {
            json!({
                "name": repo.get("full_name"),
                "clone_url": repo.get("clone_url"),
                "private": repo.get("private"),
                "default_branch": repo.get("default_branch").and_then(Value::as_str).unwrap_or("main"),
            })
        })
        .collect();

    Ok(Json(json!({ "repositories": repositories })))
}

/// Asks the GitHub API who the token belongs to; an unusable token is a 401.
async fn validate_token(token: &str) -> Result<String> {
    let response = HTTP_CLIENT
        .get("https://api.github.com/user")
        .header("authorization", format!("token {token}"))
        .send()
        .await
        .map_err(|_| Error::AuthRequired("Invalid token".to_string()))?;

    if !response.status().is_success() {
        return Err(Error::AuthRequired("Invalid token".to_string()));
    }

    let user: Value = response
        .json()
        .await
        .map_err(|_| Error::AuthRequired("Invalid token".to_string()))?;

    user.get("login")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::AuthRequired("Invalid token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_round_trip() {
        let sessions = Sessions::default();
        let id = sessions.create("tok".to_string(), "octocat".to_string());

        let session = sessions.get(&id).unwrap();
        assert_eq!(session.token, "tok");
        assert_eq!(session.username, "octocat");

        sessions.remove(&id);
        assert!(sessions.get(&id).is_none());
    }

    #[test]
    fn session_ids_are_opaque_and_unique() {
        let sessions = Sessions::default();
        let a = sessions.create("t".into(), "a".into());
        let b = sessions.create("t".into(), "b".into());
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}
