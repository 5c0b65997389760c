//! Running external tools with a hard timeout and cancellation.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{program} is not installed or not on PATH")]
    NotFound { program: String },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("{program} exited with code {code:?}: {tail}")]
    Failed {
        program: String,
        code: Option<i32>,
        tail: String,
    },
}

impl ProcessError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
pub struct ToolOutput {
    /// Full stdout, only populated when capture was requested.
    pub stdout: String,
}

/// Options for one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolRun<'a> {
    pub program: &'a Path,
    pub timeout: Duration,
    pub capture_stdout: bool,
    pub working_dir: Option<&'a Path>,
}

/// Kills the whole process group on drop unless disarmed after a clean exit.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid.take() {
            // The child was spawned with process_group(0), so its pid is the group id.
            #[allow(unsafe_code)]
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        self.disarm();
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn kill_tree(child: &mut Child, group: &mut GroupGuard) {
    group.kill();
    let _ = child.kill().await;
}

fn spawn_line_reader<R>(reader: R, source: Source, tx: mpsc::UnboundedSender<(Source, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((source, line)).is_err() {
                break;
            }
        }
    });
}

/// Runs a tool to completion, feeding every output line to `on_line`.
///
/// The child runs in its own process group. The group is killed when the
/// timeout fires, when `cancel` is triggered, or when the returned future is
/// dropped, so helpers the tool forked go down with it.
pub async fn run_tool<I, S, F>(
    run: ToolRun<'_>,
    args: I,
    cancel: &CancellationToken,
    mut on_line: F,
) -> Result<ToolOutput, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
    F: FnMut(&str) + Send,
{
    let program = run.program.display().to_string();

    let mut command = Command::new(run.program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    if let Some(dir) = run.working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProcessError::NotFound {
                program: program.clone(),
            }
        } else {
            ProcessError::Spawn {
                program: program.clone(),
                source: e,
            }
        }
    })?;
    debug!(program = %program, pid = ?child.id(), "Tool started");
    let mut group = GroupGuard { pid: child.id() };

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, Source::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, Source::Stderr, tx.clone());
    }
    drop(tx);

    let deadline = tokio::time::sleep(run.timeout);
    tokio::pin!(deadline);

    let mut output = ToolOutput::default();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                kill_tree(&mut child, &mut group).await;
                return Err(ProcessError::Cancelled { program });
            }
            _ = &mut deadline => {
                warn!(program = %program, "Tool timed out, killing");
                kill_tree(&mut child, &mut group).await;
                return Err(ProcessError::TimedOut { program, timeout: run.timeout });
            }
            line = rx.recv() => match line {
                Some((source, line)) => {
                    if source == Source::Stdout && run.capture_stdout {
                        output.stdout.push_str(&line);
                        output.stdout.push('\n');
                    } else {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                    }
                    on_line(&line);
                }
                None => break,
            },
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            kill_tree(&mut child, &mut group).await;
            return Err(ProcessError::Cancelled { program });
        }
        _ = &mut deadline => {
            kill_tree(&mut child, &mut group).await;
            return Err(ProcessError::TimedOut { program, timeout: run.timeout });
        }
        status = child.wait() => status.map_err(|e| ProcessError::Spawn {
            program: program.clone(),
            source: e,
        })?,
    };
    group.disarm();

    if !status.success() {
        let tail = tail.into_iter().collect::<Vec<_>>().join("\n");
        return Err(ProcessError::Failed {
            program,
            code: status.code(),
            tail,
        });
    }

    debug!(program = %program, "Tool finished");
    Ok(output)
}
