use std::io;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use grab_core::EndpointCategory;

use super::{admit, attachment, Guarded};
use crate::error::ApiError;
use crate::state::AppState;

/// Segment bodies buffered between the fetch task and the response.
const CHANNEL_DEPTH: usize = 16;

#[derive(Debug, Deserialize)]
pub struct ProxyRequest {
    pub url: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/proxy/hls", post(list_variants).get(stream_variant))
}

/// POST /api/v1/proxy/hls
async fn list_variants(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ProxyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let limits = admit(&state, &headers, EndpointCategory::Proxy).await?;
    let listing = state.orchestrator.proxy_variants(&body.url).await?;
    Ok((limits, Json(listing)))
}

/// GET /api/v1/proxy/hls?url=
///
/// Streams the best variant's segments as one transport stream. The response
/// is committed only after the first batch yields data, so a variant whose
/// segments all fail is reported as an error. Later failures abort the body.
/// The client going away closes the channel and cancels the fetch task.
async fn stream_variant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ProxyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let limits = admit(&state, &headers, EndpointCategory::Proxy).await?;
    let plan = state.orchestrator.plan_stream(&query.url).await?;

    let cancel = CancellationToken::new();
    let mut segments = state.orchestrator.open_stream(plan);
    let first = segments.first_chunk(&cancel).await?;

    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(CHANNEL_DEPTH);
    let task_cancel = cancel.clone();

    tokio::spawn(async move {
        for bytes in first {
            if tx.send(Ok(bytes)).await.is_err() {
                return;
            }
        }
        loop {
            match segments.next_chunk(&task_cancel).await {
                Ok(Some(chunk)) => {
                    for bytes in chunk {
                        if tx.send(Ok(bytes)).await.is_err() {
                            debug!(variant_url = %segments.variant_url(), "Proxy client went away");
                            return;
                        }
                    }
                }
                Ok(None) => {
                    debug!(
                        variant_url = %segments.variant_url(),
                        fetched = segments.report().fetched,
                        dropped = segments.report().dropped.len(),
                        "Proxy stream finished"
                    );
                    return;
                }
                Err(e) => {
                    warn!(variant_url = %segments.variant_url(), error = %e, "Proxy stream aborted");
                    let _ = tx.send(Err(io::Error::other(e))).await;
                    return;
                }
            }
        }
    });

    let chunks = Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));
    let body = Body::from_stream(Guarded::new(chunks, cancel.drop_guard()));
    Ok((
        limits,
        [
            (CONTENT_TYPE, "video/mp2t".to_string()),
            attachment("video.ts"),
        ],
        body,
    ))
}
