use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use super::session::SessionPool;
use super::{unescape_url, ExtractContext, ExtractError, Extractor};
use crate::loader::SourceLoader;
use crate::model::VideoCandidate;
use crate::playlist;
use crate::site::ExtractorKind;

/// `src` attribute of `<video>` and `<source>` elements.
static ELEMENT_SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<(?:video|source)\b[^>]*?\ssrc\s*=\s*["']([^"']+)["']"#).expect("valid regex")
});

/// Any absolute media URL referenced by the page, escaped or not.
static MEDIA_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?:(?:\\?/){2}[^\s"'<>()]+?\.(?:mp4|webm|m3u8)(?:\?[^\s"'<>()]*)?"#)
        .expect("valid regex")
});

/// Collects every media reference in a page body, in document order,
/// without duplicates. Blob and data URLs are ignored.
pub fn scan_media_refs(html: &str, page: &Url) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    let element_srcs = ELEMENT_SRC_RE
        .captures_iter(html)
        .map(|c| c.get(1).map(|m| m.as_str()).unwrap_or_default().to_string());
    let inline_refs = MEDIA_REF_RE.find_iter(html).map(|m| m.as_str().to_string());

    for raw in element_srcs.chain(inline_refs) {
        let cleaned = unescape_url(&raw);
        if cleaned.is_empty() || cleaned.starts_with("blob:") || cleaned.starts_with("data:") {
            continue;
        }
        let Ok(resolved) = page.join(&cleaned) else { continue };
        let resolved = resolved.to_string();
        if seen.insert(resolved.clone()) {
            out.push(resolved);
        }
    }
    out
}

/// Loads the page in a pooled session and reports everything media-like it
/// references. Manifests are expanded into their variants.
pub struct PageScanExtractor {
    pool: SessionPool,
    loader: Arc<dyn SourceLoader>,
    max_manifest_expansions: usize,
}

impl PageScanExtractor {
    pub fn new(pool: SessionPool, loader: Arc<dyn SourceLoader>, max_manifest_expansions: usize) -> Self {
        Self {
            pool,
            loader,
            max_manifest_expansions,
        }
    }
}

#[async_trait]
impl Extractor for PageScanExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::PageScan
    }

    async fn extract(&self, ctx: &ExtractContext<'_>) -> Result<Vec<VideoCandidate>, ExtractError> {
        let page = {
            let session = self.pool.checkout(ctx.url).await?;
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(Vec::new()),
                page = session.load(ctx.url, ctx.headers) => page?,
            }
        };

        let refs = scan_media_refs(&page.body, &page.final_url);
        debug!(url = %ctx.url, refs = refs.len(), "Page scanned");

        let mut candidates = Vec::new();
        let mut expanded = 0;
        for url in refs {
            let candidate = VideoCandidate::new(url.clone());
            let is_manifest = playlist::is_manifest_url(&url);
            candidates.push(candidate);

            if !is_manifest || expanded >= self.max_manifest_expansions {
                continue;
            }
            expanded += 1;
            match playlist::fetch_variants(self.loader.as_ref(), &url, ctx.headers).await {
                Ok(variants) => {
                    for v in variants.into_iter().filter(|v| !v.passthrough) {
                        let mut c = VideoCandidate::new(v.url.clone())
                            .with_format("m3u8")
                            .with_bandwidth(v.bandwidth);
                        if let Some(r) = v.resolution {
                            c = c.with_height(r.height);
                        }
                        candidates.push(c);
                    }
                }
                Err(e) => warn!(manifest = %url, error = %e, "Could not expand manifest"),
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{HttpLoader, RequestHeaders};
    use crate::site::GENERIC;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn scans_elements_and_inline_references() {
        let page = Url::parse("https://site.example/watch/1").unwrap();
        let html = r#"
            <video id="player" class="v" src="/media/main.mp4"></video>
            <video><source type="video/webm" src="clip.webm"></video>
            <video src="blob:https://site.example/abc"></video>
            <script>var cfg = {"hls":"https:\/\/cdn.example\/live\/master.m3u8?sig=1"};
            fetch("https://cdn.example/other.mp4"); fetch("https://cdn.example/other.mp4");</script>"#;
        assert_eq!(
            scan_media_refs(html, &page),
            vec![
                "https://site.example/media/main.mp4",
                "https://site.example/watch/clip.webm",
                "https://cdn.example/live/master.m3u8?sig=1",
                "https://cdn.example/other.mp4",
            ]
        );
    }

    #[tokio::test]
    async fn manifests_are_expanded_into_variants() {
        let server = MockServer::start().await;
        let page = format!(
            r#"<html><video src="{}/hls/master.m3u8"></video></html>"#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/watch"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hls/master.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\nlow.m3u8\n\
                 #EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720\nhigh.m3u8\n",
            ))
            .mount(&server)
            .await;

        let loader = Arc::new(HttpLoader::new(Duration::from_secs(5), 0, Duration::from_millis(10)));
        let pool = SessionPool::new(2, Duration::from_secs(5), Duration::from_secs(5));
        let extractor = PageScanExtractor::new(pool.clone(), loader, 3);

        let url = Url::parse(&format!("{}/watch", server.uri())).unwrap();
        let headers = RequestHeaders::new("UA");
        let cancel = CancellationToken::new();
        let ctx = ExtractContext {
            url: &url,
            profile: &GENERIC,
            headers: &headers,
            cancel: &cancel,
        };
        let found = extractor.extract(&ctx).await.unwrap();
        assert_eq!(found.len(), 3);
        assert!(found[0].url.ends_with("/hls/master.m3u8"));
        assert_eq!(found[1].height, Some(720));
        assert!(found[1].is_segmented);
        assert_eq!(found[2].bandwidth, Some(800_000));
        assert_eq!(pool.available(), 2);
    }
}
