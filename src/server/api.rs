//! JSON API used by the web front end: branches, commit log, repository
//! creation and removal.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use depot_git::history;
use depot_git::object::Signature;
use depot_store::Prefetch;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::auth::{authorize_repo, require_user};
use super::AppState;
use crate::directory::{DirectoryError, RepoDirectory};

const DEFAULT_LOG_LIMIT: usize = 30;
const MAX_LOG_LIMIT: usize = 500;

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn git_error(e: depot_git::Error) -> Response {
    if e.is_not_found() {
        return json_error(StatusCode::NOT_FOUND, e.to_string());
    }
    error!("api: {}", e);
    json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn signature_json(sig: &Signature) -> Value {
    json!({
        "name": sig.name,
        "email": sig.email,
        "time": sig.time,
    })
}

/// GET /api/:owner/:repo/branches
pub async fn list_branches(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let (_, repo) = match authorize_repo(&state, &headers, &owner, &repo, false).await {
        Ok(found) => found,
        Err(denied) => return denied.into_response(),
    };

    let result = async {
        let storage = state.storage(&repo.prefix, Prefetch::AllKeys).await?;
        history::list_branches(&storage).await
    }
    .await;

    match result {
        Ok(branches) => {
            let branches: Vec<Value> = branches
                .iter()
                .map(|b| {
                    json!({
                        "name": b.name,
                        "commit": b.oid.to_hex(),
                        "head": b.is_head,
                    })
                })
                .collect();
            Json(json!({ "branches": branches })).into_response()
        }
        Err(e) => git_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    limit: Option<usize>,
}

/// GET /api/:owner/:repo/commits/:branch?limit=N
pub async fn list_commits(
    State(state): State<AppState>,
    Path((owner, repo, branch)): Path<(String, String, String)>,
    Query(query): Query<LogQuery>,
    headers: HeaderMap,
) -> Response {
    let (_, repo) = match authorize_repo(&state, &headers, &owner, &repo, false).await {
        Ok(found) => found,
        Err(denied) => return denied.into_response(),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);

    let result = async {
        let storage = state.storage(&repo.prefix, Prefetch::AllKeys).await?;
        let tip = history::resolve_commitish(&storage, &branch).await?;
        history::log(&storage, tip, limit).await
    }
    .await;

    match result {
        Ok(entries) => {
            let commits: Vec<Value> = entries
                .iter()
                .map(|entry| {
                    json!({
                        "oid": entry.oid.to_hex(),
                        "tree": entry.commit.tree.to_hex(),
                        "parents": entry.commit.parents.iter().map(|p| p.to_hex()).collect::<Vec<_>>(),
                        "author": signature_json(&entry.commit.author),
                        "committer": signature_json(&entry.commit.committer),
                        "summary": entry.commit.summary(),
                        "message": entry.commit.message,
                    })
                })
                .collect();
            Json(json!({ "commits": commits })).into_response()
        }
        Err(e) => git_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRepo {
    pub name: String,
    #[serde(default)]
    pub private: bool,
}

/// POST /api/repos, creates a repository owned by the caller
pub async fn create_repo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRepo>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(denied) => return denied.into_response(),
    };

    match state
        .directory
        .create_repository(&user, &body.name, body.private)
        .await
    {
        Ok(repo) => (
            StatusCode::CREATED,
            Json(json!({
                "owner": user.username,
                "name": repo.name,
                "private": repo.private,
                "path": format!("/{}/{}.git", user.username, repo.name),
            })),
        )
            .into_response(),
        Err(e) => directory_error(e),
    }
}

/// DELETE /api/:owner/:repo, owner only
pub async fn delete_repo(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let (owner, repo) = match authorize_repo(&state, &headers, &owner, &repo, true).await {
        Ok(found) => found,
        Err(denied) => return denied.into_response(),
    };

    match state.directory.remove_repository(&owner, &repo.name).await {
        Ok(()) => {
            info!("deleted {}/{}", owner.username, repo.name);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => directory_error(e),
    }
}

fn directory_error(e: DirectoryError) -> Response {
    let status = match &e {
        DirectoryError::InvalidName(_) => StatusCode::BAD_REQUEST,
        DirectoryError::AlreadyExists(_) => StatusCode::CONFLICT,
        DirectoryError::NotFound(_) | DirectoryError::UnknownUser(_) => StatusCode::NOT_FOUND,
        DirectoryError::Git(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("api: {}", e);
    }
    json_error(status, e.to_string())
}
