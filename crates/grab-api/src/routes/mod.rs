mod admin;
mod convert;
mod download;
mod extract;
mod presigned;
mod proxy;
mod status;

use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue, CONTENT_DISPOSITION};
use axum::http::HeaderMap;
use axum::response::{IntoResponseParts, ResponseParts};
use axum::Router;
use futures::Stream;
use tokio_util::io::ReaderStream;
use tracing::info;

use grab_core::{Admission, EndpointCategory};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(extract::router())
        .merge(convert::router())
        .merge(proxy::router())
        .merge(download::router())
        .merge(presigned::router())
        .merge(status::router())
        .merge(admin::router())
}

/// Client identity for rate limiting: first forwarded address, then the
/// real-IP header, then loopback.
pub(crate) fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(real_ip)
        .unwrap_or("127.0.0.1")
        .to_string()
}

/// Budget headers for an admitted request.
pub(crate) struct RateLimitHeaders(Admission);

impl IntoResponseParts for RateLimitHeaders {
    type Error = std::convert::Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        if let Admission::Allowed {
            limit,
            remaining,
            reset_at,
        } = self.0
        {
            let headers = res.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            headers.insert("x-ratelimit-reset", HeaderValue::from(reset_at.timestamp()));
        }
        Ok(res)
    }
}

/// Counts the request against the caller's budget for `category`.
pub(crate) async fn admit(
    state: &AppState,
    headers: &HeaderMap,
    category: EndpointCategory,
) -> Result<RateLimitHeaders, ApiError> {
    let client = client_ip(headers);
    match state.admission.check(&client, category).await {
        Admission::Rejected {
            limit,
            retry_after_secs,
            reset_at,
        } => {
            info!(client = %client, %category, retry_after_secs, "Rate limit exceeded");
            state.metrics.record_rate_limited(category);
            Err(ApiError::RateLimited {
                retry_after_secs,
                limit: Some(limit),
                reset_at: Some(reset_at),
            })
        }
        admission => Ok(RateLimitHeaders(admission)),
    }
}

pub(crate) fn attachment(filename: &str) -> (HeaderName, String) {
    let safe: String = filename
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    (CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", safe))
}

/// A response stream that keeps `guard` alive until the body is finished or
/// the client goes away.
pub(crate) struct Guarded<S, G> {
    inner: S,
    _guard: G,
}

impl<S, G> Guarded<S, G> {
    pub(crate) fn new(inner: S, guard: G) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl<S: Stream + Unpin, G: Unpin> Stream for Guarded<S, G> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Streams a local file as a response body.
pub(crate) async fn file_body<G>(path: &Path, guard: G) -> Result<Body, ApiError>
where
    G: Unpin + Send + 'static,
{
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to open {}: {}", path.display(), e)))?;
    Ok(Body::from_stream(Guarded::new(ReaderStream::new(file), guard)))
}
