//! Segmented-stream manifest parsing.
//!
//! Master playlists are parsed line by line so a single malformed variant only
//! drops that variant. Media playlists go through `m3u8_rs` first and fall back
//! to a plain scan of URI lines for origins that emit non-conforming tags.

use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::loader::{LoadError, RequestHeaders, SourceLoader};

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("No video streams found in {url}")]
    NotFound { url: String },

    #[error("Invalid playlist URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Load(#[from] LoadError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// One declared rendition of a master playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantDescriptor {
    pub url: String,
    pub bandwidth: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codecs: Option<String>,
    /// The input was already a media playlist and this descriptor is the input itself.
    pub passthrough: bool,
}

impl VariantDescriptor {
    /// `720p` when the resolution is declared, otherwise kilobits (`2500k`).
    pub fn quality_label(&self) -> String {
        match self.resolution {
            Some(r) => format!("{}p", r.height),
            None if self.bandwidth > 0 => format!("{}k", (self.bandwidth + 500) / 1000),
            None => "unknown".to_string(),
        }
    }
}

/// True when the URL looks like a segmented-stream manifest.
pub fn is_manifest_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    path.ends_with(".m3u8") || path.contains(".m3u8/")
}

/// Resolves `uri` against the playlist it appeared in.
pub fn resolve_uri(base: &Url, uri: &str) -> Result<String, PlaylistError> {
    base.join(uri.trim())
        .map(|u| u.to_string())
        .map_err(|e| PlaylistError::InvalidUrl {
            url: uri.to_string(),
            reason: e.to_string(),
        })
}

fn parse_base(playlist_url: &str) -> Result<Url, PlaylistError> {
    Url::parse(playlist_url).map_err(|e| PlaylistError::InvalidUrl {
        url: playlist_url.to_string(),
        reason: e.to_string(),
    })
}

/// Splits an attribute list on commas outside quoted strings.
fn parse_attributes(list: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    let mut flush = |current: &mut String| {
        if let Some((k, v)) = current.split_once('=') {
            attrs.push((
                k.trim().to_ascii_uppercase(),
                v.trim().trim_matches('"').to_string(),
            ));
        }
        current.clear();
    };

    for ch in list.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            ',' if !quoted => flush(&mut current),
            _ => current.push(ch),
        }
    }
    flush(&mut current);
    attrs
}

fn parse_resolution(value: &str) -> Option<Resolution> {
    let (w, h) = value.split_once(['x', 'X'])?;
    Some(Resolution {
        width: w.trim().parse().ok()?,
        height: h.trim().parse().ok()?,
    })
}

/// Playlists must open with `#EXTM3U`; anything else (an HTML error page, a
/// JSON body) is not a playlist at all.
fn has_playlist_header(text: &str) -> bool {
    text.trim_start_matches('\u{feff}')
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .is_some_and(|l| l.starts_with("#EXTM3U"))
}

/// Parses master playlist text into variants, best first.
pub fn parse_master(text: &str, playlist_url: &str) -> Result<Vec<VariantDescriptor>, PlaylistError> {
    let base = parse_base(playlist_url)?;
    if !has_playlist_header(text) {
        debug!(playlist = playlist_url, "Body is not a playlist");
        return Err(PlaylistError::NotFound {
            url: playlist_url.to_string(),
        });
    }
    let lines: Vec<&str> = text.lines().map(str::trim).collect();

    let mut variants = Vec::new();
    let mut saw_stream_tag = false;
    let mut saw_segment = false;
    let mut after_extinf = false;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        i += 1;

        let Some(attr_list) = line.strip_prefix("#EXT-X-STREAM-INF:") else {
            if line.starts_with("#EXTINF") {
                after_extinf = true;
            } else if after_extinf && !line.is_empty() && !line.starts_with('#') {
                saw_segment = true;
                after_extinf = false;
            }
            continue;
        };
        saw_stream_tag = true;

        while i < lines.len() && lines[i].is_empty() {
            i += 1;
        }
        let Some(uri) = lines.get(i).copied() else {
            debug!(playlist = playlist_url, "Stream declaration without URI at end of playlist");
            break;
        };
        if uri.starts_with('#') {
            debug!(playlist = playlist_url, next = uri, "Stream declaration not followed by URI");
            continue;
        }
        i += 1;

        let attrs = parse_attributes(attr_list);
        let bandwidth = attrs
            .iter()
            .find(|(k, _)| k == "BANDWIDTH")
            .and_then(|(_, v)| v.parse::<u64>().ok());
        let Some(bandwidth) = bandwidth else {
            debug!(playlist = playlist_url, uri, "Skipping variant with missing or malformed BANDWIDTH");
            continue;
        };

        let url = match resolve_uri(&base, uri) {
            Ok(url) => url,
            Err(e) => {
                debug!(playlist = playlist_url, uri, error = %e, "Skipping variant with unresolvable URI");
                continue;
            }
        };

        variants.push(VariantDescriptor {
            url,
            bandwidth,
            resolution: attrs
                .iter()
                .find(|(k, _)| k == "RESOLUTION")
                .and_then(|(_, v)| parse_resolution(v)),
            codecs: attrs
                .iter()
                .find(|(k, _)| k == "CODECS")
                .map(|(_, v)| v.clone()),
            passthrough: false,
        });
    }

    if !saw_stream_tag && saw_segment {
        return Ok(vec![VariantDescriptor {
            url: playlist_url.to_string(),
            bandwidth: 0,
            resolution: None,
            codecs: None,
            passthrough: true,
        }]);
    }

    if variants.is_empty() {
        return Err(PlaylistError::NotFound {
            url: playlist_url.to_string(),
        });
    }

    variants.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
    Ok(variants)
}

/// Parses a media playlist into absolute segment URLs, in playlist order.
pub fn parse_segments(text: &str, variant_url: &str) -> Result<Vec<String>, PlaylistError> {
    let base = parse_base(variant_url)?;
    if !has_playlist_header(text) {
        return Err(PlaylistError::NotFound {
            url: variant_url.to_string(),
        });
    }

    let uris: Vec<String> = match m3u8_rs::parse_media_playlist_res(text.as_bytes()) {
        Ok(pl) if !pl.segments.is_empty() => pl.segments.into_iter().map(|s| s.uri).collect(),
        Ok(_) => Vec::new(),
        Err(e) => {
            debug!(playlist = variant_url, error = %e, "Falling back to line scan for segments");
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect()
        }
    };

    let segments = uris
        .iter()
        .map(|uri| resolve_uri(&base, uri))
        .collect::<Result<Vec<_>, _>>()?;

    if segments.is_empty() {
        return Err(PlaylistError::NotFound {
            url: variant_url.to_string(),
        });
    }
    Ok(segments)
}

/// Fetches and parses a master (or media) playlist.
pub async fn fetch_variants(
    loader: &dyn SourceLoader,
    playlist_url: &str,
    headers: &RequestHeaders,
) -> Result<Vec<VariantDescriptor>, PlaylistError> {
    let text = loader.load_text(playlist_url, headers).await?;
    parse_master(&text, playlist_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://cdn.example.com/vod/abc/master.m3u8";

    #[test]
    fn variants_sorted_descending_with_relative_resolution() {
        let text = "#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n\
            360p/index.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1280x720,CODECS=\"avc1.4d401f,mp4a.40.2\"\n\
            720p/index.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080\n\
            /abs/1080p.m3u8\n";
        let variants = parse_master(text, BASE).unwrap();
        assert_eq!(variants.len(), 3);
        assert_eq!(variants[0].url, "https://cdn.example.com/abs/1080p.m3u8");
        assert_eq!(variants[1].url, "https://cdn.example.com/vod/abc/720p/index.m3u8");
        assert_eq!(variants[1].codecs.as_deref(), Some("avc1.4d401f,mp4a.40.2"));
        assert_eq!(variants[2].quality_label(), "360p");
        for pair in variants.windows(2) {
            assert!(pair[0].bandwidth > pair[1].bandwidth);
        }
    }

    #[test]
    fn equal_bandwidth_keeps_first_seen_order() {
        let text = "#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=1000\n\
            a.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=1000\n\
            b.m3u8\n";
        let variants = parse_master(text, BASE).unwrap();
        assert!(variants[0].url.ends_with("/a.m3u8"));
        assert!(variants[1].url.ends_with("/b.m3u8"));
    }

    #[test]
    fn malformed_bandwidth_skips_only_that_variant() {
        let text = "#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=abc,RESOLUTION=640x360\n\
            bad.m3u8\n\
            #EXT-X-STREAM-INF:RESOLUTION=640x360\n\
            missing.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=1200000\n\
            good.m3u8\n";
        let variants = parse_master(text, BASE).unwrap();
        assert_eq!(variants.len(), 1);
        assert!(variants[0].url.ends_with("/good.m3u8"));
        assert_eq!(variants[0].quality_label(), "1200k");
    }

    #[test]
    fn media_playlist_is_single_passthrough_variant() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10.0,\nseg0.ts\n#EXTINF:10.0,\nseg1.ts\n";
        let variants = parse_master(text, BASE).unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].url, BASE);
        assert!(variants[0].passthrough);
    }

    #[test]
    fn empty_playlist_is_not_found() {
        assert!(matches!(
            parse_master("#EXTM3U\n#EXT-X-VERSION:3\n", BASE),
            Err(PlaylistError::NotFound { .. })
        ));
        assert!(matches!(parse_master("", BASE), Err(PlaylistError::NotFound { .. })));
    }

    #[test]
    fn non_playlist_body_is_not_found() {
        let html = "<!DOCTYPE html>\n<html><body>\n<h1>403 Forbidden</h1>\n</body></html>\n";
        assert!(matches!(parse_master(html, BASE), Err(PlaylistError::NotFound { .. })));
        assert!(matches!(parse_segments(html, BASE), Err(PlaylistError::NotFound { .. })));

        let json = "{\"error\": \"expired\"}\n";
        assert!(matches!(parse_master(json, BASE), Err(PlaylistError::NotFound { .. })));
    }

    #[test]
    fn uri_lines_need_extinf_to_count_as_segments() {
        let text = "#EXTM3U\n#EXT-X-VERSION:3\nstray-line\n";
        assert!(matches!(parse_master(text, BASE), Err(PlaylistError::NotFound { .. })));
    }

    #[test]
    fn unresolvable_variant_uri_skips_only_that_variant() {
        let text = "#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=900000\n\
            low.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=5000000\n\
            http://[::1\n\
            #EXT-X-STREAM-INF:BANDWIDTH=2000000\n\
            mid.m3u8\n";
        let variants = parse_master(text, BASE).unwrap();
        assert_eq!(variants.len(), 2);
        assert!(variants[0].url.ends_with("/mid.m3u8"));
        assert!(variants[1].url.ends_with("/low.m3u8"));
    }

    #[test]
    fn stream_tag_followed_by_tag_is_skipped() {
        let text = "#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=500\n\
            #EXT-X-STREAM-INF:BANDWIDTH=900\n\
            hi.m3u8\n";
        let variants = parse_master(text, BASE).unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].bandwidth, 900);
    }

    #[test]
    fn segments_resolve_in_order() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n\
            #EXTINF:6.0,\nfile0.ts\n#EXTINF:6.0,\nhttps://other.example/file1.ts\n#EXTINF:6.0,\nchunk-2.m4s\n#EXT-X-ENDLIST\n";
        let segs = parse_segments(text, "https://cdn.example.com/vod/720p/index.m3u8").unwrap();
        assert_eq!(
            segs,
            vec![
                "https://cdn.example.com/vod/720p/file0.ts",
                "https://other.example/file1.ts",
                "https://cdn.example.com/vod/720p/chunk-2.m4s",
            ]
        );
    }

    #[test]
    fn segment_free_media_playlist_is_not_found() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-ENDLIST\n";
        assert!(matches!(
            parse_segments(text, BASE),
            Err(PlaylistError::NotFound { .. })
        ));
    }

    #[test]
    fn manifest_url_detection() {
        assert!(is_manifest_url("https://a.example/x/master.m3u8"));
        assert!(is_manifest_url("https://a.example/x/MASTER.M3U8?token=1"));
        assert!(!is_manifest_url("https://a.example/x/video.mp4"));
        assert!(!is_manifest_url("https://a.example/x/video.mp4?next=a.m3u8"));
    }
}
