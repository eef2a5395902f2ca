//! http.rs — the HTTP surface: a healthcheck endpoint, range-capable file
//! serving (spec §6 "Range requests"), and share-token resolution. The web
//! UI, auth, and share-link *issuance* are explicitly out of scope (spec §1);
//! this only exposes the storage read path a share endpoint needs.
use std::collections::HashMap;
use std::ops::Bound;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_extra::headers::Range;
use axum_extra::TypedHeader;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::VaultError;
use crate::range::RangeStreamer;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/files/:id", get(serve_file))
        .route("/share/:token", get(serve_shared_file))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Resolves a share token to its file_id and serves it exactly like
/// `/files/:id` — the only share-link behaviour in scope (spec §1).
async fn serve_shared_file(
    State(state): State<AppState>,
    Path(token): Path<String>,
    query: Query<HashMap<String, String>>,
    range_header: Option<TypedHeader<Range>>,
) -> Response {
    let file_id = match state.index.resolve_share_token(&token).await {
        Ok(Some(id)) => id,
        Ok(None) => return (StatusCode::NOT_FOUND, "share not found or expired").into_response(),
        Err(e) => return error_response(e.into()),
    };
    serve_file(State(state), Path(file_id), query, range_header).await
}

async fn serve_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<HashMap<String, String>>,
    range_header: Option<TypedHeader<Range>>,
) -> Response {
    let key = query.get("key").cloned();

    let file = match state.index.get_file_by_id(id).await {
        Ok(Some(f)) => f,
        Ok(None) => return (StatusCode::NOT_FOUND, "file not found").into_response(),
        Err(e) => return error_response(e.into()),
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
    if let Some(mime) = &file.mime_type {
        if let Ok(v) = mime.parse() {
            headers.insert(header::CONTENT_TYPE, v);
        }
    }

    if let Some(TypedHeader(range)) = range_header {
        let Some((start, end)) = single_satisfiable_range(&range, file.size) else {
            return (StatusCode::RANGE_NOT_SATISFIABLE, format!("Content-Range: bytes */{}", file.size)).into_response();
        };

        let cancel = CancellationToken::new();
        let bytes = match state.ranger.range_stream(id, start, end, key, &cancel).await {
            Ok(b) => b,
            Err(e) => return error_response(e),
        };

        headers.insert(header::CONTENT_RANGE, format!("bytes {start}-{end}/{}", file.size).parse().unwrap());
        headers.insert(header::CONTENT_LENGTH, bytes.len().to_string().parse().unwrap());
        return (StatusCode::PARTIAL_CONTENT, headers, Body::from(bytes)).into_response();
    }

    let cancel = CancellationToken::new();
    let opts = crate::download::DownloadOptions { encryption_key: key, cancel };
    let stream = match state.downloader.download_stream(id, opts).await {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };

    headers.insert(header::CONTENT_LENGTH, file.size.to_string().parse().unwrap());
    let body = Body::from_stream(stream);
    (StatusCode::OK, headers, body).into_response()
}

/// Extracts the single requested byte range, rejecting multi-range requests
/// per spec §6. `axum_extra`'s `Range` resolves `bytes=-N` suffix forms too.
fn single_satisfiable_range(range: &Range, total_len: u64) -> Option<(u64, u64)> {
    let mut ranges = range.satisfiable_ranges(total_len);
    let (start_bound, end_bound) = ranges.next()?;
    if ranges.next().is_some() {
        return None; // multi-range not supported
    }
    let start = match start_bound {
        Bound::Included(n) => n,
        Bound::Excluded(n) => n + 1,
        Bound::Unbounded => 0,
    };
    let end = match end_bound {
        Bound::Included(n) => n,
        Bound::Excluded(n) => n.saturating_sub(1),
        Bound::Unbounded => total_len.saturating_sub(1),
    };
    if start > end || end >= total_len {
        return None;
    }
    Some((start, end))
}

fn error_response(e: VaultError) -> Response {
    let status = match &e {
        VaultError::SourceDataMissing(_) => StatusCode::NOT_FOUND,
        VaultError::MissingKey => StatusCode::UNAUTHORIZED,
        VaultError::AuthenticationFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        VaultError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        VaultError::RateLimited { .. } | VaultError::TransferFailed(_) | VaultError::BackendUnavailable(_) => {
            StatusCode::BAD_GATEWAY
        }
        VaultError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        VaultError::ConfigInvalid(_) | VaultError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!("http request failed: {e}");
    (status, e.to_string()).into_response()
}
