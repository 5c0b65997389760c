//! Conversion of segmented streams into a single deliverable file.
//!
//! The primary tool gets the original page URL when there is one, since it
//! understands the site and picks renditions itself. The fallback tool only
//! ever sees the raw stream URL and copies it without re-encoding.

mod job;
pub mod process;
pub mod progress;
pub mod tools;

pub use job::{DownloadJob, JobState};
pub use process::{ProcessError, ToolRun};
pub use progress::{NoProgress, ProgressSink, ProgressTracker};

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GrabConfig;
use crate::loader::RequestHeaders;
use crate::spool::{ArtifactSpool, SpooledArtifact};

const INSTALL_HINT: &str = "Install yt-dlp for more reliable downloads of this stream";

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Neither {primary} nor {fallback} is available")]
    ToolsMissing { primary: String, fallback: String },

    #[error("Conversion failed: {0}")]
    Tool(#[from] ProcessError),

    #[error("Output file too small ({size} bytes), download likely incomplete")]
    Incomplete { size: u64 },

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Working directory error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Incomplete { .. } => true,
            Self::Tool(e) => matches!(e, ProcessError::TimedOut { .. } | ProcessError::Failed { .. }),
            _ => false,
        }
    }

    /// Actionable advice for the caller, when there is any.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ToolsMissing { .. } | Self::Incomplete { .. } => Some(INSTALL_HINT),
            _ => None,
        }
    }
}

/// What to convert.
#[derive(Debug, Clone)]
pub struct TranscodeRequest<'a> {
    /// Raw segmented-stream URL.
    pub stream_url: &'a str,
    /// Page the stream was found on. Preferred by the primary tool.
    pub source_url: Option<&'a str>,
    pub max_height: Option<u32>,
    pub separate_av: bool,
    pub headers: &'a RequestHeaders,
}

#[derive(Debug, Clone)]
pub struct Transcoder {
    primary_tool: PathBuf,
    fallback_tool: PathBuf,
    process_timeout: Duration,
    segment_secs: u64,
    min_output_bytes: u64,
    temp_root: Option<PathBuf>,
}

impl Transcoder {
    pub fn from_config(config: &GrabConfig) -> Self {
        Self {
            primary_tool: config.primary_tool.clone(),
            fallback_tool: config.fallback_tool.clone(),
            process_timeout: config.process_timeout,
            segment_secs: config.fallback_segment_secs,
            min_output_bytes: config.min_output_bytes,
            temp_root: config.temp_root.clone(),
        }
    }

    /// Converts the stream and moves the result into `spool`.
    pub async fn run(
        &self,
        request: &TranscodeRequest<'_>,
        spool: &ArtifactSpool,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<SpooledArtifact, TranscodeError> {
        let mut job = DownloadJob::create(self.temp_root.as_deref())?;
        job.start();
        info!(job_id = %job.id(), stream_url = request.stream_url, "Conversion started");

        match self.drive(&mut job, request, sink, cancel).await {
            Ok(size) => match spool.adopt(job.output_path()).await {
                Ok(artifact) => {
                    job.succeed(sink);
                    info!(job_id = %job.id(), size, "Conversion succeeded");
                    Ok(artifact)
                }
                Err(e) => {
                    job.fail();
                    Err(TranscodeError::Io(e))
                }
            },
            Err(e) => {
                job.fail();
                warn!(job_id = %job.id(), error = %e, "Conversion failed");
                Err(e)
            }
        }
    }

    /// Runs primary then, if needed, fallback. Returns the output size.
    async fn drive(
        &self,
        job: &mut DownloadJob,
        request: &TranscodeRequest<'_>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64, TranscodeError> {
        let output = job.output_path().to_path_buf();
        let dir = job
            .dir()
            .map(Path::to_path_buf)
            .ok_or(TranscodeError::Cancelled)?;

        let input = request.source_url.unwrap_or(request.stream_url);
        let selector = tools::format_selector(request.max_height, request.separate_av);
        let args = tools::primary_args(input, &output, &selector, request.headers);

        let primary = process::run_tool(
            self.tool_run(&self.primary_tool, &dir),
            args,
            cancel,
            |line| job.observe(line, sink),
        )
        .await;

        let primary_missing = match primary {
            Ok(_) => match self.usable_size(&output).await {
                Ok(size) => return Ok(size),
                Err(size) => {
                    warn!(job_id = %job.id(), size, "Primary tool output incomplete, trying fallback");
                    false
                }
            },
            Err(e) if e.is_cancelled() => return Err(TranscodeError::Cancelled),
            Err(e) => {
                warn!(job_id = %job.id(), error = %e, "Primary tool failed, trying fallback");
                e.is_not_found()
            }
        };

        let _ = tokio::fs::remove_file(&output).await;
        match self.run_fallback(job, request, &dir, &output, sink, cancel).await {
            Err(TranscodeError::Tool(e)) if e.is_not_found() && primary_missing => {
                Err(TranscodeError::ToolsMissing {
                    primary: self.primary_tool.display().to_string(),
                    fallback: self.fallback_tool.display().to_string(),
                })
            }
            Err(TranscodeError::Tool(e)) if e.is_cancelled() => Err(TranscodeError::Cancelled),
            Err(e) => Err(e),
            Ok(()) => self
                .usable_size(&output)
                .await
                .map_err(|size| TranscodeError::Incomplete { size }),
        }
    }

    async fn run_fallback(
        &self,
        job: &mut DownloadJob,
        request: &TranscodeRequest<'_>,
        dir: &Path,
        output: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        let list = dir.join("parts.ffconcat");
        let parts = dir.join("part_%03d.mp4");

        let split = tools::fallback_split_args(
            request.stream_url,
            &parts,
            &list,
            self.segment_secs,
            request.headers,
        );
        process::run_tool(self.tool_run(&self.fallback_tool, dir), split, cancel, |line| {
            job.observe(line, sink)
        })
        .await?;

        let join = tools::fallback_join_args(&list, output);
        process::run_tool(self.tool_run(&self.fallback_tool, dir), join, cancel, |_| {}).await?;
        Ok(())
    }

    fn tool_run<'a>(&self, program: &'a Path, dir: &'a Path) -> ToolRun<'a> {
        ToolRun {
            program,
            timeout: self.process_timeout,
            capture_stdout: false,
            working_dir: Some(dir),
        }
    }

    /// `Ok(size)` when the output exists and is above the minimum, `Err(size)` otherwise.
    async fn usable_size(&self, output: &Path) -> Result<u64, u64> {
        let size = tokio::fs::metadata(output)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if size > self.min_output_bytes {
            Ok(size)
        } else {
            Err(size)
        }
    }
}
