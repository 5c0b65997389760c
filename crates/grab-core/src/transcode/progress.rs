//! Translation of external tool output into progress values.
//!
//! This is the only place that reads tool status lines. Everything else sees
//! a fraction in `[0, 1]` that never decreases.

use std::sync::LazyLock;

use regex::Regex;
use tokio::sync::watch;

/// Total duration assumed when the tool never reports one.
pub const ASSUMED_TOTAL_SECS: f64 = 1320.0;

static ELAPSED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=(\d{2}):(\d{2}):(\d{2})(?:\.(\d+))?").expect("valid elapsed regex")
});

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d{2}):(\d{2}):(\d{2})(?:\.(\d+))?").expect("valid duration regex")
});

static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[download\]\s+(\d{1,3}(?:\.\d+)?)%").expect("valid percent regex")
});

/// Receives progress updates from a running job.
pub trait ProgressSink: Send + Sync {
    fn report(&self, fraction: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(f64) + Send + Sync,
{
    fn report(&self, fraction: f64) {
        self(fraction)
    }
}

impl ProgressSink for watch::Sender<f64> {
    fn report(&self, fraction: f64) {
        let _ = self.send(fraction);
    }
}

/// Discards progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _fraction: f64) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToolStatus {
    /// Total input duration in seconds.
    Duration(f64),
    /// Elapsed media time in seconds.
    Elapsed(f64),
    /// Completion percentage, 0 to 100.
    Percent(f64),
}

fn hms(caps: &regex::Captures<'_>) -> Option<f64> {
    let h: f64 = caps.get(1)?.as_str().parse().ok()?;
    let m: f64 = caps.get(2)?.as_str().parse().ok()?;
    let s: f64 = caps.get(3)?.as_str().parse().ok()?;
    let frac = caps
        .get(4)
        .and_then(|f| format!("0.{}", f.as_str()).parse::<f64>().ok())
        .unwrap_or(0.0);
    Some(h * 3600.0 + m * 60.0 + s + frac)
}

/// Extracts the status carried by one line of tool output, if any.
pub fn parse_status_line(line: &str) -> Option<ToolStatus> {
    if let Some(caps) = PERCENT_RE.captures(line) {
        return caps[1].parse().ok().map(ToolStatus::Percent);
    }
    if let Some(caps) = DURATION_RE.captures(line) {
        return hms(&caps).map(ToolStatus::Duration);
    }
    if let Some(caps) = ELAPSED_RE.captures(line) {
        return hms(&caps).map(ToolStatus::Elapsed);
    }
    None
}

/// Folds tool statuses into a non-decreasing fraction.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_secs: Option<f64>,
    current: f64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            total_secs: None,
            current: 0.0,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    /// Applies one line of output. Returns the new fraction when it advanced.
    pub fn observe(&mut self, line: &str) -> Option<f64> {
        let candidate = match parse_status_line(line)? {
            ToolStatus::Duration(total) => {
                if total > 0.0 {
                    self.total_secs = Some(total);
                }
                return None;
            }
            ToolStatus::Elapsed(elapsed) => {
                elapsed / self.total_secs.unwrap_or(ASSUMED_TOTAL_SECS)
            }
            ToolStatus::Percent(p) => p / 100.0,
        };
        self.advance(candidate)
    }

    /// Moves forward to `fraction` if it is ahead of the current value.
    pub fn advance(&mut self, fraction: f64) -> Option<f64> {
        let clamped = fraction.clamp(0.0, 1.0);
        if clamped > self.current {
            self.current = clamped;
            Some(clamped)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ffmpeg_and_ytdlp_lines() {
        assert_eq!(
            parse_status_line("  Duration: 00:10:00.50, start: 0.000000, bitrate: 1200 kb/s"),
            Some(ToolStatus::Duration(600.5))
        );
        assert_eq!(
            parse_status_line("frame= 100 fps=25 q=-1.0 size=1024kB time=00:01:30.00 bitrate=93.2kbits/s"),
            Some(ToolStatus::Elapsed(90.0))
        );
        assert_eq!(
            parse_status_line("[download]  42.5% of ~120.00MiB at 2.00MiB/s ETA 00:30"),
            Some(ToolStatus::Percent(42.5))
        );
        assert_eq!(parse_status_line("[info] Writing video metadata"), None);
    }

    #[test]
    fn elapsed_uses_reported_duration() {
        let mut t = ProgressTracker::new();
        assert_eq!(t.observe("Duration: 00:02:00.00, start: 0"), None);
        assert_eq!(t.observe("time=00:01:00.00"), Some(0.5));
    }

    #[test]
    fn elapsed_without_duration_uses_assumed_total() {
        let mut t = ProgressTracker::new();
        let f = t.observe("time=00:11:00").unwrap();
        assert!((f - 660.0 / ASSUMED_TOTAL_SECS).abs() < 1e-9);
    }

    #[test]
    fn progress_never_decreases() {
        let mut t = ProgressTracker::new();
        assert_eq!(t.observe("[download]  60.0% of 10MiB"), Some(0.6));
        // second pass of a merge restarts its own counter
        assert_eq!(t.observe("[download]  10.0% of 2MiB"), None);
        assert_eq!(t.current(), 0.6);
        assert_eq!(t.observe("[download] 100% of 2MiB"), Some(1.0));
        assert_eq!(t.advance(1.5), None);
    }

    #[test]
    fn closures_and_watch_channels_are_sinks() {
        let (tx, rx) = watch::channel(0.0);
        tx.report(0.25);
        assert_eq!(*rx.borrow(), 0.25);

        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |f: f64| seen.lock().unwrap().push(f);
        sink.report(0.5);
        assert_eq!(*seen.lock().unwrap(), vec![0.5]);
    }
}
