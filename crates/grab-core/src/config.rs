use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Configuration shared by the extraction, download and delivery pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrabConfig {
    /// HTTP request timeout for pages, manifests and segments.
    pub request_timeout: Duration,
    /// Maximum number of retries for failed HTTP fetches.
    pub max_retries: u32,
    /// Base backoff duration for retries (doubled each attempt).
    pub retry_backoff: Duration,
    /// User agent sent to origins.
    pub user_agent: String,
    /// Number of segments downloaded concurrently per batch.
    pub segment_batch_size: usize,
    /// Converted output at or below this size is treated as incomplete.
    pub min_output_bytes: u64,
    /// Artifacts larger than this are delivered through a presigned grant.
    pub direct_threshold_bytes: u64,
    /// Lifetime of an issued presigned grant.
    pub grant_ttl: Duration,
    pub primary_tool: PathBuf,
    pub fallback_tool: PathBuf,
    /// Hard limit for a single external tool run.
    pub process_timeout: Duration,
    /// Time-box used by the fallback tool when splitting long inputs.
    pub fallback_segment_secs: u64,
    /// Page navigation timeout for the page-observing extractor.
    pub navigation_timeout: Duration,
    /// Time allowed for a page body to finish loading once navigation succeeded.
    pub settle_timeout: Duration,
    /// Maximum number of page sessions checked out at once.
    pub session_pool_size: usize,
    /// Maximum number of manifests expanded into variants per page.
    pub max_manifest_expansions: usize,
    /// Parent directory for per-job temp directories. System temp dir when unset.
    pub temp_root: Option<PathBuf>,
    /// Directory holding finished artifacts until their grant expires.
    pub spool_dir: PathBuf,
}

impl Default for GrabConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            max_retries: 2,
            retry_backoff: Duration::from_millis(200),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            segment_batch_size: 5,
            min_output_bytes: 1024 * 1024,
            direct_threshold_bytes: 10 * 1024 * 1024,
            grant_ttl: Duration::from_secs(60 * 60),
            primary_tool: PathBuf::from("yt-dlp"),
            fallback_tool: PathBuf::from("ffmpeg"),
            process_timeout: Duration::from_secs(30 * 60),
            fallback_segment_secs: 600,
            navigation_timeout: Duration::from_secs(30),
            settle_timeout: Duration::from_secs(10),
            session_pool_size: 4,
            max_manifest_expansions: 3,
            temp_root: None,
            spool_dir: std::env::temp_dir().join("media-grab-spool"),
        }
    }
}

impl GrabConfig {
    pub fn with_request_timeout(mut self, ms: u64) -> Self {
        self.request_timeout = Duration::from_millis(ms);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, ms: u64) -> Self {
        self.retry_backoff = Duration::from_millis(ms);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_segment_batch_size(mut self, size: usize) -> Self {
        self.segment_batch_size = size.max(1);
        self
    }

    pub fn with_min_output_bytes(mut self, bytes: u64) -> Self {
        self.min_output_bytes = bytes;
        self
    }

    pub fn with_direct_threshold_bytes(mut self, bytes: u64) -> Self {
        self.direct_threshold_bytes = bytes;
        self
    }

    pub fn with_grant_ttl(mut self, secs: u64) -> Self {
        self.grant_ttl = Duration::from_secs(secs.max(1));
        self
    }

    pub fn with_primary_tool(mut self, path: impl Into<PathBuf>) -> Self {
        self.primary_tool = path.into();
        self
    }

    pub fn with_fallback_tool(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_tool = path.into();
        self
    }

    pub fn with_process_timeout(mut self, secs: u64) -> Self {
        self.process_timeout = Duration::from_secs(secs.max(1));
        self
    }

    pub fn with_navigation_timeout(mut self, ms: u64) -> Self {
        self.navigation_timeout = Duration::from_millis(ms);
        self
    }

    pub fn with_settle_timeout(mut self, ms: u64) -> Self {
        self.settle_timeout = Duration::from_millis(ms);
        self
    }

    pub fn with_session_pool_size(mut self, size: usize) -> Self {
        self.session_pool_size = size.max(1);
        self
    }

    pub fn with_temp_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(path.into());
        self
    }

    pub fn with_spool_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.spool_dir = path.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_delivery_constants() {
        let c = GrabConfig::default();
        assert_eq!(c.segment_batch_size, 5);
        assert_eq!(c.min_output_bytes, 1024 * 1024);
        assert_eq!(c.direct_threshold_bytes, 10 * 1024 * 1024);
        assert_eq!(c.grant_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn batch_size_is_never_zero() {
        let c = GrabConfig::default().with_segment_batch_size(0);
        assert_eq!(c.segment_batch_size, 1);
    }
}
