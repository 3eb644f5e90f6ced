use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine;

use super::AppState;
use crate::directory::{Credentials, RepoDirectory, Repository, User};

/// Why a request was turned away before touching storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    /// No usable credentials
    Unauthorized,
    /// Valid credentials, wrong user
    Forbidden,
    /// Unknown owner or repository
    NotFound,
}

impl IntoResponse for Denied {
    fn into_response(self) -> Response {
        match self {
            Denied::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"depot\"")],
                "Unauthorized",
            )
                .into_response(),
            Denied::Forbidden => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
            Denied::NotFound => (StatusCode::NOT_FOUND, "Repository not found").into_response(),
        }
    }
}

/// Parse `Authorization: Basic <user:key>` or `Authorization: Bearer <token>`
pub fn parse_credentials(headers: &HeaderMap) -> Option<Credentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;

    if let Some(encoded) = value.strip_prefix("Basic ") {
        let engine = base64::engine::general_purpose::STANDARD;
        let decoded = String::from_utf8(engine.decode(encoded.trim()).ok()?).ok()?;
        let (username, api_key) = decoded.split_once(':')?;
        return Some(Credentials::Basic {
            username: username.to_string(),
            api_key: api_key.to_string(),
        });
    }

    value
        .strip_prefix("Bearer ")
        .map(|token| Credentials::Bearer(token.trim().to_string()))
}

/// The authenticated user, or 401
pub async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<User, Denied> {
    let credentials = parse_credentials(headers).ok_or(Denied::Unauthorized)?;
    state
        .directory
        .authenticate(&credentials)
        .await
        .ok_or(Denied::Unauthorized)
}

/// Look up a repository and check the caller may use it.
///
/// Reads of a public repository are open. Writes, and any access to a
/// private repository, need the owner's credentials.
pub async fn authorize_repo(
    state: &AppState,
    headers: &HeaderMap,
    owner: &str,
    repo: &str,
    write: bool,
) -> Result<(User, Repository), Denied> {
    let (owner, repo) = state
        .directory
        .get_repo_owner_and_repo(owner, repo)
        .await
        .ok_or(Denied::NotFound)?;

    if !write && !repo.private {
        return Ok((owner, repo));
    }

    let user = require_user(state, headers).await?;
    if user.id != owner.id {
        return Err(Denied::Forbidden);
    }
    Ok((owner, repo))
}
