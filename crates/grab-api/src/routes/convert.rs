use axum::extract::State;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use grab_core::{ConvertOutcome, ConvertRequest, DeliveryMethod, EndpointCategory, NoProgress};

use super::{admit, attachment, file_body};
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/convert", post(convert))
}

/// POST /api/v1/convert
///
/// Small results stream back as `video/mp4`; large ones come back as a
/// presigned grant.
async fn convert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConvertRequest>,
) -> Result<Response, ApiError> {
    let limits = admit(&state, &headers, EndpointCategory::Conversion).await?;

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let outcome = match state.orchestrator.convert(&body, &NoProgress, &cancel).await {
        Ok(outcome) => outcome,
        Err(e) => {
            state.metrics.record_conversion_failure();
            return Err(e.into());
        }
    };

    match outcome {
        ConvertOutcome::Direct(grant) => {
            state.metrics.record_conversion(DeliveryMethod::Direct);
            state.metrics.record_grant_issued();
            Ok((limits, Json(grant)).into_response())
        }
        ConvertOutcome::Tunnel(artifact) => {
            state.metrics.record_conversion(DeliveryMethod::Tunnel);
            let size = artifact.size();
            let path = artifact.path().to_path_buf();
            let body = file_body(&path, artifact).await?;
            Ok((
                limits,
                [
                    (CONTENT_TYPE, "video/mp4".to_string()),
                    (CONTENT_LENGTH, size.to_string()),
                    attachment("video.mp4"),
                ],
                body,
            )
                .into_response())
        }
    }
}
