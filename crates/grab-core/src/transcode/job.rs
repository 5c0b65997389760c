use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::TempDir;
use uuid::Uuid;

use super::progress::{ProgressSink, ProgressTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One conversion, owning an exclusive temp working directory.
///
/// The directory is removed when the job reaches a terminal state or is
/// dropped, whichever happens first.
pub struct DownloadJob {
    id: Uuid,
    dir: Option<TempDir>,
    output_path: PathBuf,
    state: JobState,
    progress: ProgressTracker,
}

impl DownloadJob {
    pub fn create(temp_root: Option<&Path>) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("grab_");
        let dir = match temp_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        let output_path = dir.path().join("output.mp4");
        Ok(Self {
            id: Uuid::new_v4(),
            dir: Some(dir),
            output_path,
            state: JobState::Idle,
            progress: ProgressTracker::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> f64 {
        self.progress.current()
    }

    /// Working directory. `None` once the job is terminal.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn start(&mut self) {
        if self.state == JobState::Idle {
            self.state = JobState::Running;
        }
    }

    /// Feeds one tool output line, forwarding any progress gain to `sink`.
    pub fn observe(&mut self, line: &str, sink: &dyn ProgressSink) {
        if let Some(fraction) = self.progress.observe(line) {
            sink.report(fraction);
        }
    }

    /// Marks success. The output must already have been moved out of the
    /// working directory, which is deleted here.
    pub fn succeed(&mut self, sink: &dyn ProgressSink) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(fraction) = self.progress.advance(1.0) {
            sink.report(fraction);
        }
        self.state = JobState::Succeeded;
        self.dir = None;
    }

    pub fn fail(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = JobState::Failed;
        self.dir = None;
    }
}

impl std::fmt::Debug for DownloadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadJob")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("progress", &self.progress.current())
            .finish()
    }
}
