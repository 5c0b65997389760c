use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use grab_core::{GrabError, StoreStats};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    pub extractions: StoreStats,
    pub grants_issued: u64,
    pub grants_rejected: u64,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/admin/stats", get(stats))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), GrabError> {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match (state.admin_token.as_deref(), presented) {
        (Some(expected), Some(token)) if !expected.is_empty() && token == expected => Ok(()),
        _ => Err(GrabError::Auth("Admin authentication required".into())),
    }
}

/// GET /api/v1/admin/stats
async fn stats(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let extractions = state.orchestrator.stats().await?;
    Ok(Json(AdminStats {
        extractions,
        grants_issued: state.metrics.grants_issued(),
        grants_rejected: state.metrics.grants_rejected(),
    }))
}
