use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use grab_core::delivery::file_name_of;
use grab_core::{EndpointCategory, RemoteBody, RemoteRoute};

use super::{admit, attachment};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub url: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/download", get(download))
}

/// GET /api/v1/download?url=
async fn download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let limits = admit(&state, &headers, EndpointCategory::Download).await?;

    match state.orchestrator.route_remote(&query.url).await? {
        RemoteRoute::Direct(grant) => {
            state.metrics.record_grant_issued();
            Ok((limits, Json(grant)).into_response())
        }
        RemoteRoute::Tunnel { url, headers, .. } => {
            let remote = state.orchestrator.open_remote(&url, &headers).await?;
            let filename = file_name_of(&url, "download");
            Ok((limits, remote_response(remote, &filename)).into_response())
        }
    }
}

/// Relays an open remote body, passing through its type and length.
pub(crate) fn remote_response(remote: RemoteBody, filename: &str) -> Response {
    let content_type = remote
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let mut response = (
        [(CONTENT_TYPE, content_type), attachment(filename)],
        Body::from_stream(remote.stream),
    )
        .into_response();
    if let Some(len) = remote.content_length {
        response.headers_mut().insert(CONTENT_LENGTH, len.into());
    }
    response
}
