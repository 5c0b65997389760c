use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;
use url::Url;

use super::{unescape_url, ExtractContext, ExtractError, Extractor};
use crate::loader::SourceLoader;
use crate::model::{height_from_label, VideoCandidate};
use crate::site::ExtractorKind;

/// Player media definitions: small JSON objects carrying a `videoUrl`.
static MEDIA_DEFINITION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{[^{}]*"videoUrl"\s*:\s*"[^"]+"[^{}]*\}"#).expect("valid regex"));

static VIDEO_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""videoUrl"\s*:\s*"([^"]+)""#).expect("valid regex"));

static QUALITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""quality"\s*:\s*"?(\d{3,4})"#).expect("valid regex"));

static FORMAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""format"\s*:\s*"([a-z0-9]+)""#).expect("valid regex"));

/// `setVideoUrlHigh('...')`, `setVideoUrlLow(...)`, `setVideoHLS(...)` player calls.
static PLAYER_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"setVideo(UrlHigh|UrlLow|HLS)\(\s*['"]([^'"]+)['"]\s*\)"#).expect("valid regex")
});

static OG_VIDEO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta[^>]+property=["']og:video(?::url|:secure_url)?["'][^>]+content=["']([^"']+)["']"#)
        .expect("valid regex")
});

static CONTENT_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""contentUrl"\s*:\s*"([^"]+)""#).expect("valid regex"));

fn absolute(page: &Url, raw: &str) -> Option<String> {
    let cleaned = unescape_url(raw.trim());
    if cleaned.is_empty() {
        return None;
    }
    page.join(&cleaned).ok().map(|u| u.to_string())
}

/// Finds video references in a page's inline player configuration.
pub fn parse_page_scripts(html: &str, page: &Url) -> Vec<VideoCandidate> {
    let mut out = Vec::new();

    for def in MEDIA_DEFINITION_RE.find_iter(html) {
        let def = def.as_str();
        let Some(url) = VIDEO_URL_RE
            .captures(def)
            .and_then(|c| absolute(page, &c[1]))
        else {
            continue;
        };
        let mut c = VideoCandidate::new(url);
        if let Some(format) = FORMAT_RE.captures(def) {
            c = c.with_format(&format[1]);
        }
        if let Some(h) = QUALITY_RE
            .captures(def)
            .and_then(|q| height_from_label(&q[1]))
        {
            c = c.with_height(h);
        }
        out.push(c);
    }

    for caps in PLAYER_CALL_RE.captures_iter(html) {
        let Some(url) = absolute(page, &caps[2]) else { continue };
        let c = VideoCandidate::new(url);
        out.push(match &caps[1] {
            "HLS" => c.with_format("m3u8"),
            "UrlHigh" => c.with_quality("high"),
            _ => c.with_quality("low"),
        });
    }

    for re in [&*OG_VIDEO_RE, &*CONTENT_URL_RE] {
        for caps in re.captures_iter(html) {
            if let Some(url) = absolute(page, &caps[1]) {
                out.push(VideoCandidate::new(url));
            }
        }
    }

    out
}

/// Reads the page and parses embedded player configuration.
pub struct PageScriptExtractor {
    loader: Arc<dyn SourceLoader>,
}

impl PageScriptExtractor {
    pub fn new(loader: Arc<dyn SourceLoader>) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl Extractor for PageScriptExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::PageScript
    }

    async fn extract(&self, ctx: &ExtractContext<'_>) -> Result<Vec<VideoCandidate>, ExtractError> {
        let html = self.loader.load_text(ctx.url.as_str(), ctx.headers).await?;
        let candidates = parse_page_scripts(&html, ctx.url);
        debug!(url = %ctx.url, found = candidates.len(), "Page scripts parsed");
        Ok(candidates)
    }
}
