use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grant::GrantError;
use crate::transcode::TranscodeError;

/// Pipeline stage an upstream failure was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Manifest,
    Segments,
    Metadata,
    Delivery,
    Storage,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extraction => write!(f, "Extraction"),
            Self::Manifest => write!(f, "Manifest"),
            Self::Segments => write!(f, "Segments"),
            Self::Metadata => write!(f, "Metadata"),
            Self::Delivery => write!(f, "Delivery"),
            Self::Storage => write!(f, "Storage"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    Forbidden,
    RateLimited,
    NotFound,
    Upstream,
    Transcode,
}

/// Failures surfaced to callers of the pipeline.
///
/// Per-strategy and per-segment failures are absorbed where they happen and
/// never reach this type; only exhaustion does.
#[derive(Debug, Error)]
pub enum GrabError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("Invalid or expired download link")]
    InvalidGrant,

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("{0}")]
    NotFound(String),

    #[error("{stage} failed for {url}: {message}")]
    Upstream {
        url: String,
        stage: Stage,
        strategy: Option<String>,
        message: String,
    },

    #[error("{message}")]
    Transcode {
        message: String,
        retryable: bool,
        hint: Option<String>,
    },
}

impl GrabError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn upstream(url: impl Into<String>, stage: Stage, message: impl fmt::Display) -> Self {
        Self::Upstream {
            url: url.into(),
            stage,
            strategy: None,
            message: message.to_string(),
        }
    }

    /// Attaches the extraction strategy that was running; no-op for other kinds.
    pub fn with_strategy(mut self, name: impl Into<String>) -> Self {
        if let Self::Upstream { strategy, .. } = &mut self {
            *strategy = Some(name.into());
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Auth(_) => ErrorKind::Auth,
            Self::InvalidGrant => ErrorKind::Forbidden,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::Transcode { .. } => ErrorKind::Transcode,
        }
    }
}

impl From<GrantError> for GrabError {
    fn from(_: GrantError) -> Self {
        Self::InvalidGrant
    }
}

impl From<TranscodeError> for GrabError {
    fn from(err: TranscodeError) -> Self {
        let retryable = err.is_retryable();
        let hint = err.hint().map(str::to_string);
        Self::Transcode {
            message: err.to_string(),
            retryable,
            hint,
        }
    }
}
