//! Direct versus tunnel delivery decisions.

use serde::Serialize;
use url::Url;

use crate::grant::PresignedGrant;
use crate::loader::HeadInfo;

/// Extensions that are always handed out through a grant, whatever their size.
pub const DIRECT_EXTENSIONS: &[&str] = &[
    ".mp4", ".webm", ".avi", ".mov", ".mkv", ".flv", ".m3u8", ".mpd", ".ts", ".m4s", ".zip",
    ".rar", ".7z", ".iso", ".dmg", ".exe", ".msi",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    Direct,
    Tunnel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    Extension,
    Size,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub method: DeliveryMethod,
    pub reason: RouteReason,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryRouter {
    threshold: u64,
}

impl DeliveryRouter {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Extension override, ignoring query string and fragment.
    pub fn routes_direct_by_extension(target: &str) -> bool {
        let lower = target.to_ascii_lowercase();
        let path = lower.split(['?', '#']).next().unwrap_or(&lower);
        DIRECT_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }

    /// Full decision for a target whose size is known.
    pub fn decide(&self, target: &str, size: u64) -> RouteDecision {
        if Self::routes_direct_by_extension(target) {
            return RouteDecision {
                method: DeliveryMethod::Direct,
                reason: RouteReason::Extension,
                size,
            };
        }
        self.decide_by_size(size)
    }

    /// Size-only decision, used for freshly converted artifacts whose
    /// container is always one of the override extensions.
    pub fn decide_by_size(&self, size: u64) -> RouteDecision {
        if size > self.threshold {
            RouteDecision {
                method: DeliveryMethod::Direct,
                reason: RouteReason::Size,
                size,
            }
        } else {
            RouteDecision {
                method: DeliveryMethod::Tunnel,
                reason: RouteReason::Default,
                size,
            }
        }
    }

    /// Size estimate from a HEAD response. A chunked response with no
    /// declared length is assumed to be large.
    pub fn estimate_size(&self, info: &HeadInfo) -> u64 {
        match info.content_length {
            Some(len) => len,
            None if info.chunked => self.threshold + 1,
            None => 0,
        }
    }
}

/// Host of `target`, or an empty string for unparseable input.
pub fn extract_domain(target: &str) -> String {
    Url::parse(target)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Last path segment of `target`, falling back to `fallback`.
pub fn file_name_of(target: &str, fallback: &str) -> String {
    Url::parse(target)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// JSON body returned when a client is sent to a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantResponse {
    pub download_url: String,
    pub expires: i64,
    pub size: u64,
    pub filename: String,
    pub method: DeliveryMethod,
}

impl GrantResponse {
    pub fn new(grant: &PresignedGrant, endpoint: &str, filename: impl Into<String>) -> Self {
        Self {
            download_url: grant.download_url(endpoint),
            expires: grant.expires,
            size: grant.size,
            filename: filename.into(),
            method: DeliveryMethod::Direct,
        }
    }
}
