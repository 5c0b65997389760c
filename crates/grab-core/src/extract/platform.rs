use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{ExtractContext, ExtractError, Extractor};
use crate::config::GrabConfig;
use crate::model::VideoCandidate;
use crate::site::ExtractorKind;
use crate::transcode::process::{self, ToolRun};
use crate::transcode::tools;

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    formats: Vec<Format>,
}

#[derive(Debug, Deserialize)]
struct Format {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    height: Option<u32>,
    /// Total bitrate in kbit/s.
    #[serde(default)]
    tbr: Option<f64>,
    #[serde(default)]
    vcodec: Option<String>,
    #[serde(default)]
    acodec: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    format_note: Option<String>,
}

fn codec_present(codec: &Option<String>) -> bool {
    codec.as_deref().map(|c| c != "none").unwrap_or(true)
}

/// Turns the primary tool's `-J` output into candidates. Audio-only and
/// storyboard formats are skipped.
pub fn parse_metadata(json: &str) -> Result<Vec<VideoCandidate>, ExtractError> {
    let meta: Metadata = serde_json::from_str(json).map_err(|e| ExtractError::Parse {
        what: "platform metadata",
        reason: e.to_string(),
    })?;

    let mut candidates = Vec::new();
    for f in meta.formats {
        let Some(url) = f.url else { continue };
        if !codec_present(&f.vcodec) || f.ext.as_deref() == Some("mhtml") {
            continue;
        }
        let segmented = f
            .protocol
            .as_deref()
            .is_some_and(|p| p.contains("m3u8") || p.contains("dash"));

        let mut c = VideoCandidate::new(url).with_tracks(codec_present(&f.acodec), true);
        if let Some(ext) = f.ext {
            c = c.with_format(ext);
        }
        c.is_segmented = c.is_segmented || segmented;
        if let Some(h) = f.height {
            c = c.with_height(h);
        } else if let Some(note) = f.format_note {
            c = c.with_quality(note);
        }
        if let Some(tbr) = f.tbr {
            c = c.with_bandwidth((tbr * 1000.0).round() as u64);
        }
        candidates.push(c);
    }

    if candidates.is_empty() {
        if let Some(url) = meta.url {
            let mut c = VideoCandidate::new(url);
            if let Some(ext) = meta.ext {
                c = c.with_format(ext);
            }
            if let Some(h) = meta.height {
                c = c.with_height(h);
            }
            candidates.push(c);
        }
    }
    Ok(candidates)
}

/// Asks the primary download tool for the page's format list.
pub struct PlatformExtractor {
    program: PathBuf,
    timeout: Duration,
}

impl PlatformExtractor {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &GrabConfig) -> Self {
        Self::new(config.primary_tool.clone(), config.navigation_timeout * 2)
    }
}

#[async_trait]
impl Extractor for PlatformExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Platform
    }

    async fn extract(&self, ctx: &ExtractContext<'_>) -> Result<Vec<VideoCandidate>, ExtractError> {
        let args = tools::metadata_args(ctx.url.as_str(), ctx.headers);
        let run = ToolRun {
            program: &self.program,
            timeout: self.timeout,
            capture_stdout: true,
            working_dir: None,
        };
        let output = process::run_tool(run, args, ctx.cancel, |_| {}).await?;
        let candidates = parse_metadata(&output.stdout)?;
        debug!(url = %ctx.url, formats = candidates.len(), "Platform metadata parsed");
        Ok(candidates)
    }
}
