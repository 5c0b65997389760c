use axum::extract::{Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::info;

use grab_core::delivery::file_name_of;
use grab_core::{EndpointCategory, GrabError, GrantParams, GrantTarget};

use super::download::remote_response;
use super::{admit, attachment, client_ip, file_body};
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/presigned", get(redeem))
}

/// GET /api/v1/presigned?path=&size=&domain=&expires=&signature=
async fn redeem(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<GrantParams>,
) -> Result<Response, ApiError> {
    let limits = admit(&state, &headers, EndpointCategory::Download).await?;

    let target = match state.orchestrator.redeem(&params).await {
        Ok(target) => target,
        Err(e @ GrabError::InvalidGrant) => {
            info!(client = %client_ip(&headers), "Rejected presigned grant");
            state.metrics.record_grant_rejected();
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    match target {
        GrantTarget::Local { path, size } => {
            let body = file_body(&path, ()).await?;
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
        GrantTarget::Remote { url, headers, .. } => {
            let remote = state.orchestrator.open_remote(&url, &headers).await?;
            let filename = file_name_of(&url, "download");
            Ok((limits, remote_response(remote, &filename)).into_response())
        }
    }
}
