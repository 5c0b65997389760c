use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use grab_core::{EndpointCategory, Submission};

use super::admit;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    pub url: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/extract", post(submit_extraction))
        .route("/extract/{id}", get(get_extraction))
}

/// POST /api/v1/extract
async fn submit_extraction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExtractRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let limits = admit(&state, &headers, EndpointCategory::Extraction).await?;

    // a dropped request future cancels whatever strategy is still running
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match state.orchestrator.submit(&body.url, &cancel).await {
        Ok(result) => {
            state.metrics.record_extraction(result.videos.len());
            Ok((limits, Json(Submission::from(&result))))
        }
        Err(e) => {
            state.metrics.record_extraction_failure();
            Err(e.into())
        }
    }
}

/// GET /api/v1/extract/{id}
async fn get_extraction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let limits = admit(&state, &headers, EndpointCategory::Results).await?;
    let result = state.orchestrator.result(&id).await?;
    Ok((limits, Json(result)))
}
