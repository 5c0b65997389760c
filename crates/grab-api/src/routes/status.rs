use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;

use grab_core::Budget;

use super::client_ip;
use crate::state::AppState;

#[derive(Serialize)]
pub struct RateLimitStatus {
    pub client: String,
    pub limits: Vec<Budget>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/status/rate-limits", get(rate_limits))
}

/// GET /api/v1/status/rate-limits
///
/// Reports the caller's standing without spending any budget.
async fn rate_limits(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let client = client_ip(&headers);
    let limits = state.admission.budgets(&client, Utc::now()).await;
    Json(RateLimitStatus { client, limits })
}
