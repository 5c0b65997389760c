mod page_scan;
mod page_script;
mod platform;
mod runner;
pub mod session;

pub use page_scan::PageScanExtractor;
pub use page_script::{parse_page_scripts, PageScriptExtractor};
pub use platform::{parse_metadata, PlatformExtractor};
pub use runner::{Attempt, StrategyOutcome, StrategySelector};
pub use session::{LoadedPage, PageSession, SessionPool};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::loader::{LoadError, RequestHeaders};
use crate::model::VideoCandidate;
use crate::playlist::PlaylistError;
use crate::site::{ExtractorKind, SiteProfile};
use crate::transcode::ProcessError;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Tool(#[from] ProcessError),

    #[error(transparent)]
    Playlist(#[from] PlaylistError),

    #[error("Unparseable {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    #[error("Page session failed for {url}: {reason}")]
    Session { url: String, reason: String },
}

/// Everything an extractor needs to know about one request.
pub struct ExtractContext<'a> {
    pub url: &'a Url,
    pub profile: &'static SiteProfile,
    pub headers: &'a RequestHeaders,
    pub cancel: &'a CancellationToken,
}

/// One way of finding videos on a page.
///
/// Implementations may fail freely; the selector treats an error exactly like
/// an empty result and moves on to the next capability.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn kind(&self) -> ExtractorKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    async fn extract(&self, ctx: &ExtractContext<'_>) -> Result<Vec<VideoCandidate>, ExtractError>;
}

/// Replaces JSON and JS escapes commonly found around embedded URLs.
pub(crate) fn unescape_url(raw: &str) -> String {
    raw.replace("\\/", "/")
        .replace("\\u002F", "/")
        .replace("\\u0026", "&")
        .replace("&amp;", "&")
}
