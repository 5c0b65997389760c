use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Succeeded,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A submitted extraction. Immutable once it reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRequest {
    pub id: Uuid,
    pub source_url: String,
    pub submitted_at: DateTime<Utc>,
    status: RequestStatus,
}

impl ExtractionRequest {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_url: source_url.into(),
            submitted_at: Utc::now(),
            status: RequestStatus::Pending,
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Moves the request to a terminal status. Returns false if it was already terminal.
    pub fn finish(&mut self, status: RequestStatus) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }
}

/// One playable resource found on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCandidate {
    pub url: String,
    pub format: String,
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub is_segmented: bool,
    pub has_audio: bool,
    pub has_video: bool,
}

impl VideoCandidate {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let format = format_from_url(&url).to_string();
        let is_segmented = is_segmented_format(&format);
        Self {
            url,
            format,
            quality: "unknown".to_string(),
            bandwidth: None,
            height: None,
            is_segmented,
            has_audio: true,
            has_video: true,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self.is_segmented = is_segmented_format(&self.format);
        self
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = quality.into();
        if self.height.is_none() {
            self.height = height_from_label(&self.quality);
        }
        self
    }

    pub fn with_height(mut self, height: u32) -> Self {
        self.height = Some(height);
        if self.quality == "unknown" {
            self.quality = format!("{}p", height);
        }
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    pub fn with_tracks(mut self, has_audio: bool, has_video: bool) -> Self {
        self.has_audio = has_audio;
        self.has_video = has_video;
        self
    }

    /// Sort key: higher is preferred. Height first, then bandwidth.
    pub fn preference_key(&self) -> (u32, u64) {
        (self.height.unwrap_or(0), self.bandwidth.unwrap_or(0))
    }
}

fn is_segmented_format(format: &str) -> bool {
    matches!(format, "m3u8" | "hls" | "mpd" | "dash")
}

/// Container tag guessed from the URL path's extension.
pub fn format_from_url(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    for (ext, tag) in [
        (".m3u8", "m3u8"),
        (".mpd", "mpd"),
        (".mp4", "mp4"),
        (".webm", "webm"),
        (".mov", "mov"),
        (".mkv", "mkv"),
        (".flv", "flv"),
        (".ts", "ts"),
    ] {
        if path.ends_with(ext) {
            return tag;
        }
    }
    "unknown"
}

/// Parses labels like `720p`, `1080P60` or `480` into a height.
pub fn height_from_label(label: &str) -> Option<u32> {
    let digits: String = label
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok().filter(|h| *h > 0)
}

/// Removes duplicate URLs (first occurrence wins) and orders the rest by
/// descending preference. The sort is stable so equal candidates keep
/// discovery order.
pub fn rank_candidates(candidates: Vec<VideoCandidate>) -> Vec<VideoCandidate> {
    let mut seen = HashSet::new();
    let mut ranked: Vec<VideoCandidate> = candidates
        .into_iter()
        .filter(|c| seen.insert(c.url.clone()))
        .collect();
    ranked.sort_by(|a, b| b.preference_key().cmp(&a.preference_key()));
    ranked
}

/// The single, append-only outcome of one extraction request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub id: Uuid,
    pub source_url: String,
    pub videos: Vec<VideoCandidate>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractionResult {
    pub fn succeeded(
        request: &ExtractionRequest,
        videos: Vec<VideoCandidate>,
        strategy: Option<String>,
    ) -> Self {
        Self {
            id: request.id,
            source_url: request.source_url.clone(),
            videos: rank_candidates(videos),
            success: true,
            error: None,
            strategy,
            extracted_at: Utc::now(),
        }
    }

    pub fn failed(request: &ExtractionRequest, error: impl Into<String>) -> Self {
        Self {
            id: request.id,
            source_url: request.source_url.clone(),
            videos: Vec::new(),
            success: false,
            error: Some(error.into()),
            strategy: None,
            extracted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_immutable_once_terminal() {
        let mut req = ExtractionRequest::new("https://example.com/watch");
        assert!(!req.finish(RequestStatus::Pending));
        assert!(req.finish(RequestStatus::Succeeded));
        assert!(!req.finish(RequestStatus::Failed));
        assert_eq!(req.status(), RequestStatus::Succeeded);
    }

    #[test]
    fn candidate_infers_format_and_segmentation() {
        let c = VideoCandidate::new("https://cdn.example/master.m3u8?token=abc");
        assert_eq!(c.format, "m3u8");
        assert!(c.is_segmented);

        let c = VideoCandidate::new("https://cdn.example/clip.mp4");
        assert_eq!(c.format, "mp4");
        assert!(!c.is_segmented);
    }

    #[test]
    fn quality_label_sets_height() {
        let c = VideoCandidate::new("https://cdn.example/a.mp4").with_quality("1080p");
        assert_eq!(c.height, Some(1080));
        let c = VideoCandidate::new("https://cdn.example/a.mp4").with_height(480);
        assert_eq!(c.quality, "480p");
    }

    #[test]
    fn ranking_is_non_increasing_and_deduplicated() {
        let ranked = rank_candidates(vec![
            VideoCandidate::new("https://c/240.mp4").with_height(240),
            VideoCandidate::new("https://c/1080.mp4").with_height(1080),
            VideoCandidate::new("https://c/240.mp4").with_height(240),
            VideoCandidate::new("https://c/720a.mp4").with_height(720).with_bandwidth(100),
            VideoCandidate::new("https://c/720b.mp4").with_height(720).with_bandwidth(900),
        ]);
        let urls: Vec<_> = ranked.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://c/1080.mp4", "https://c/720b.mp4", "https://c/720a.mp4", "https://c/240.mp4"]
        );
        for pair in ranked.windows(2) {
            assert!(pair[0].preference_key() >= pair[1].preference_key());
        }
    }

    #[test]
    fn ranking_keeps_discovery_order_for_ties() {
        let ranked = rank_candidates(vec![
            VideoCandidate::new("https://c/first.mp4"),
            VideoCandidate::new("https://c/second.mp4"),
        ]);
        assert_eq!(ranked[0].url, "https://c/first.mp4");
    }

    #[test]
    fn result_serializes_camel_case() {
        let req = ExtractionRequest::new("https://example.com/v");
        let result = ExtractionResult::succeeded(&req, vec![], Some("page-scan".into()));
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("sourceUrl").is_some());
        assert!(json.get("extractedAt").is_some());
        assert!(json.get("error").is_none());
    }
}
