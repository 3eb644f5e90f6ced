//! Git smart HTTP protocol routes
//!
//! Routes:
//!   - GET  /:owner/:repo/info/refs?service=git-upload-pack|git-receive-pack
//!   - POST /:owner/:repo/git-upload-pack
//!   - POST /:owner/:repo/git-receive-pack
//!
//! `:repo` may carry a `.git` suffix. Authorization runs before any
//! storage access.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use depot_git::http::{handle_info_refs, handle_receive_pack, handle_upload_pack, Service};
use depot_store::Prefetch;
use std::collections::HashMap;
use tracing::{error, info};

use super::auth::authorize_repo;
use super::AppState;

/// Map an engine error to a status with a textual body
pub fn git_error_response(e: depot_git::Error) -> Response {
    let status = match &e {
        depot_git::Error::ProtocolError(_) => StatusCode::BAD_REQUEST,
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("git request failed: {}", e);
    }
    (status, e.to_string()).into_response()
}

fn git_response(content_type: &str, body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response()
}

/// GET /:owner/:repo/info/refs?service=...
pub async fn info_refs(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let Some(service) = params.get("service").and_then(|s| Service::parse(s)) else {
        return (StatusCode::BAD_REQUEST, "Unknown service").into_response();
    };

    let write = service == Service::ReceivePack;
    let (_, repo) = match authorize_repo(&state, &headers, &owner, &repo, write).await {
        Ok(found) => found,
        Err(denied) => return denied.into_response(),
    };

    let storage = match state.storage(&repo.prefix, Prefetch::AllKeys).await {
        Ok(s) => s,
        Err(e) => return git_error_response(e),
    };

    match handle_info_refs(&storage, service).await {
        Ok((content_type, body)) => {
            info!("info/refs {} for {}", service.as_str(), repo.prefix);
            git_response(&content_type, body)
        }
        Err(e) => git_error_response(e),
    }
}

/// POST /:owner/:repo/git-upload-pack (fetch)
pub async fn upload_pack(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (_, repo) = match authorize_repo(&state, &headers, &owner, &repo, false).await {
        Ok(found) => found,
        Err(denied) => return denied.into_response(),
    };

    let storage = match state.storage(&repo.prefix, Prefetch::AllKeys).await {
        Ok(s) => s,
        Err(e) => return git_error_response(e),
    };

    match handle_upload_pack(&storage, &body).await {
        Ok(response) => git_response(Service::UploadPack.result_content_type(), response),
        Err(e) => git_error_response(e),
    }
}

/// POST /:owner/:repo/git-receive-pack (push), owner only
pub async fn receive_pack(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (_, repo) = match authorize_repo(&state, &headers, &owner, &repo, true).await {
        Ok(found) => found,
        Err(denied) => return denied.into_response(),
    };

    let storage = match state.storage(&repo.prefix, Prefetch::None).await {
        Ok(s) => s,
        Err(e) => return git_error_response(e),
    };

    match handle_receive_pack(&storage, &state.locks, &repo.prefix, &body).await {
        Ok(response) => git_response(Service::ReceivePack.result_content_type(), response),
        Err(e) => git_error_response(e),
    }
}
