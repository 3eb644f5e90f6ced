//! Raw file endpoint with byte-range support
//!
//! `GET /file/:owner/:repo/:branch/*path` resolves the branch to its
//! commit, walks the tree to the blob and serves it. A `Range: bytes=a-b`
//! header gets a single `206` slice; a missing end is filled in as one
//! chunk window from the start.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use depot_git::history;
use depot_store::Prefetch;
use futures::stream;
use serde_json::json;
use tracing::{debug, error};

use super::auth::authorize_repo;
use super::mime::content_type_for;
use super::AppState;

/// Window served for an open-ended range
pub const FILE_CHUNK_SIZE: u64 = 1024 * 1024;

/// Size of body chunks when streaming a whole file
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// Inclusive start and end
    Slice(u64, u64),
    Unsatisfiable,
}

/// Parse a `Range` header against a body of `len` bytes.
///
/// Returns `None` when the header should be ignored (not a single byte
/// range), in which case the full body is served.
pub fn parse_range(value: &str, len: u64) -> Option<ByteRange> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // Suffix range: the last N bytes
        let n: u64 = end.parse().ok()?;
        if n == 0 || len == 0 {
            return Some(ByteRange::Unsatisfiable);
        }
        return Some(ByteRange::Slice(len.saturating_sub(n), len - 1));
    }

    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        start.saturating_add(FILE_CHUNK_SIZE - 1)
    } else {
        end.parse().ok()?
    };

    if start >= len || end < start {
        return Some(ByteRange::Unsatisfiable);
    }
    Some(ByteRange::Slice(start, end.min(len - 1)))
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// GET /file/:owner/:repo/:branch/*path
pub async fn serve_file(
    State(state): State<AppState>,
    Path((owner, repo, branch, path)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let (_, repo) = match authorize_repo(&state, &headers, &owner, &repo, false).await {
        Ok(found) => found,
        Err(denied) => return denied.into_response(),
    };

    // One blob dominates; point lookups beat listing the whole prefix
    let storage = match state.storage(&repo.prefix, Prefetch::None).await {
        Ok(s) => s,
        Err(e) => {
            error!("file {}: {}", repo.prefix, e);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable");
        }
    };

    let content = match history::read_file_at(&storage, &branch, &path).await {
        Ok(content) => Bytes::from(content),
        Err(e) if e.is_not_found() => {
            return json_error(StatusCode::NOT_FOUND, format!("{} not found at {}", path, branch))
        }
        Err(e) => {
            error!("file {} {}:{}: {}", repo.prefix, branch, path, e);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let len = content.len() as u64;
    let content_type = content_type_for(&path);
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, len));

    match range {
        Some(ByteRange::Slice(start, end)) => {
            debug!("file {}:{} range {}-{}/{}", branch, path, start, end, len);
            let slice = content.slice(start as usize..=end as usize);
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len)),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                slice,
            )
                .into_response()
        }
        Some(ByteRange::Unsatisfiable) => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [
                (header::CONTENT_RANGE, format!("bytes */{}", len)),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            Json(json!({ "error": "range not satisfiable" })),
        )
            .into_response(),
        None => {
            let chunks: Vec<Result<Bytes, std::io::Error>> = (0..content.len())
                .step_by(STREAM_CHUNK_SIZE)
                .map(|i| Ok(content.slice(i..(i + STREAM_CHUNK_SIZE).min(content.len()))))
                .collect();
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (header::CONTENT_LENGTH, len.to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                Body::from_stream(stream::iter(chunks)),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_range() {
        assert_eq!(parse_range("bytes=0-9", 500), Some(ByteRange::Slice(0, 9)));
        assert_eq!(parse_range("bytes=490-999", 500), Some(ByteRange::Slice(490, 499)));
        assert_eq!(parse_range("bytes=499-499", 500), Some(ByteRange::Slice(499, 499)));
    }

    #[test]
    fn test_open_range_uses_chunk_window() {
        assert_eq!(parse_range("bytes=100-", 500), Some(ByteRange::Slice(100, 499)));
        let big = 10 * FILE_CHUNK_SIZE;
        assert_eq!(
            parse_range("bytes=5-", big),
            Some(ByteRange::Slice(5, 5 + FILE_CHUNK_SIZE - 1))
        );
    }

    #[test]
    fn test_suffix_range() {
        assert_eq!(parse_range("bytes=-10", 500), Some(ByteRange::Slice(490, 499)));
        assert_eq!(parse_range("bytes=-1000", 500), Some(ByteRange::Slice(0, 499)));
        assert_eq!(parse_range("bytes=-0", 500), Some(ByteRange::Unsatisfiable));
    }

    #[test]
    fn test_unsatisfiable() {
        assert_eq!(parse_range("bytes=500-", 500), Some(ByteRange::Unsatisfiable));
        assert_eq!(parse_range("bytes=9-0", 500), Some(ByteRange::Unsatisfiable));
        assert_eq!(parse_range("bytes=0-", 0), Some(ByteRange::Unsatisfiable));
    }

    #[test]
    fn test_ignored_headers() {
        assert_eq!(parse_range("items=0-9", 500), None);
        assert_eq!(parse_range("bytes=0-1,5-6", 500), None);
        assert_eq!(parse_range("bytes=a-b", 500), None);
        assert_eq!(parse_range("bytes=10", 500), None);
    }
}
