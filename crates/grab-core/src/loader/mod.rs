mod http;

pub use http::HttpLoader;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("HTTP error {status} fetching {url}: {message}")]
    Http {
        url: String,
        status: u16,
        message: String,
        is_last_retry: bool,
    },
    #[error("Network error fetching {url}: {reason}")]
    Network {
        url: String,
        reason: String,
        is_last_retry: bool,
    },
    #[error("Timeout fetching {url}")]
    Timeout { url: String, is_last_retry: bool },
}

impl LoadError {
    pub fn is_last_retry(&self) -> bool {
        match self {
            Self::Http { is_last_retry, .. } => *is_last_retry,
            Self::Network { is_last_retry, .. } => *is_last_retry,
            Self::Timeout { is_last_retry, .. } => *is_last_retry,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Http { url, .. } | Self::Network { url, .. } | Self::Timeout { url, .. } => url,
        }
    }
}

/// Identity headers sent with every origin request of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    pub user_agent: String,
    pub referer: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl RequestHeaders {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            referer: None,
            extra: Vec::new(),
        }
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((name.into(), value.into()));
        self
    }

    /// Renders the headers in the `Name: value\r\n` form accepted by ffmpeg's `-headers`.
    pub fn to_header_block(&self) -> String {
        let mut out = format!("User-Agent: {}\r\n", self.user_agent);
        if let Some(ref referer) = self.referer {
            out.push_str(&format!("Referer: {}\r\n", referer));
        }
        for (name, value) in &self.extra {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out
    }
}

/// Result of a header-only request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadInfo {
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub content_type: Option<String>,
}

/// An open response body, consumed incrementally.
pub struct RemoteBody {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes, LoadError>>,
}

impl std::fmt::Debug for RemoteBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBody")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Trait for loading pages, playlists and segments from origins.
///
/// Implementations handle HTTP fetching, retries and identity headers.
/// The trait is object-safe and Send + Sync for use across async tasks.
#[async_trait]
pub trait SourceLoader: Send + Sync {
    async fn load_text(&self, url: &str, headers: &RequestHeaders) -> Result<String, LoadError>;

    async fn load_bytes(&self, url: &str, headers: &RequestHeaders) -> Result<Bytes, LoadError>;

    async fn head(&self, url: &str, headers: &RequestHeaders) -> Result<HeadInfo, LoadError>;

    async fn open(&self, url: &str, headers: &RequestHeaders) -> Result<RemoteBody, LoadError>;
}
