use axum::http::header::{HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use grab_core::{GrabError, Stage};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    RateLimited {
        retry_after_secs: u64,
        limit: Option<u32>,
        reset_at: Option<DateTime<Utc>>,
    },
    Internal {
        message: String,
        details: Option<ErrorDetails>,
    },
}

/// Context attached to 500 responses so a caller can tell what broke.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<ErrorDetails>,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal {
            message: message.into(),
            details: None,
        }
    }
}

impl From<GrabError> for ApiError {
    fn from(err: GrabError) -> Self {
        let message = err.to_string();
        match err {
            GrabError::Validation(msg) => ApiError::BadRequest(msg),
            GrabError::Auth(msg) => ApiError::Unauthorized(msg),
            GrabError::InvalidGrant => ApiError::Forbidden(message),
            GrabError::NotFound(msg) => ApiError::NotFound(msg),
            GrabError::RateLimited { retry_after_secs } => ApiError::RateLimited {
                retry_after_secs,
                limit: None,
                reset_at: None,
            },
            GrabError::Upstream {
                url,
                stage,
                strategy,
                ..
            } => ApiError::Internal {
                message,
                details: Some(ErrorDetails {
                    url: Some(url).filter(|u| !u.is_empty()),
                    stage: Some(stage),
                    strategy,
                    ..Default::default()
                }),
            },
            GrabError::Transcode {
                message,
                retryable,
                hint,
            } => ApiError::Internal {
                message,
                details: Some(ErrorDetails {
                    hint,
                    retryable: Some(retryable),
                    ..Default::default()
                }),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut retry_after = None;
        let mut limit_headers = None;

        let (status, error_kind, message, details) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg, None),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg, None),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg, None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, None),
            ApiError::RateLimited {
                retry_after_secs,
                limit,
                reset_at,
            } => {
                retry_after = Some(retry_after_secs);
                limit_headers = limit.zip(reset_at);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    "Too many requests, please try again later".to_string(),
                    None,
                )
            }
            ApiError::Internal { message, details } => {
                error!(error = %message, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message, details)
            }
        };

        let body = ErrorBody {
            error: error_kind.to_string(),
            message,
            retry_after,
            details,
        };

        let mut response = (status, axum::Json(body)).into_response();
        let headers = response.headers_mut();
        if let Some(secs) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        if let Some((limit, reset_at)) = limit_headers {
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
            headers.insert("x-ratelimit-reset", HeaderValue::from(reset_at.timestamp()));
        }
        response
    }
}
