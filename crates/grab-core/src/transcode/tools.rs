use std::ffi::OsString;
use std::path::Path;

use crate::loader::RequestHeaders;

/// Builds the primary tool's format-selection expression.
///
/// With `separate_av` the site never serves muxed renditions, so the video
/// stream is always paired with an audio stream explicitly.
pub fn format_selector(max_height: Option<u32>, separate_av: bool) -> String {
    match (max_height, separate_av) {
        (Some(h), false) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]/best"),
        (Some(h), true) => format!("bestvideo[height<={h}]+bestaudio/bestvideo+bestaudio"),
        (None, false) => "bestvideo+bestaudio/best".to_string(),
        (None, true) => "bestvideo+bestaudio".to_string(),
    }
}

fn push<S: Into<OsString>>(args: &mut Vec<OsString>, items: impl IntoIterator<Item = S>) {
    args.extend(items.into_iter().map(Into::into));
}

/// Arguments for a primary-tool download of `input` into `output`.
pub fn primary_args(
    input: &str,
    output: &Path,
    selector: &str,
    headers: &RequestHeaders,
) -> Vec<OsString> {
    let mut args = Vec::new();
    push(&mut args, ["-f", selector, "--merge-output-format", "mp4"]);
    push(&mut args, ["--no-check-certificate", "--no-playlist", "--no-part", "--newline"]);
    push(&mut args, ["--user-agent", headers.user_agent.as_str()]);
    if let Some(ref referer) = headers.referer {
        push(&mut args, ["--referer", referer.as_str()]);
    }
    for (name, value) in &headers.extra {
        push(&mut args, ["--add-header".to_string(), format!("{}:{}", name, value)]);
    }
    push(
        &mut args,
        [
            "--concurrent-fragments",
            "4",
            "--retries",
            "10",
            "--fragment-retries",
            "10",
            "--retry-sleep",
            "3",
        ],
    );
    push(&mut args, ["-o"]);
    args.push(output.as_os_str().to_owned());
    push(&mut args, [input]);
    args
}

/// Arguments asking the primary tool for page metadata as JSON.
pub fn metadata_args(page_url: &str, headers: &RequestHeaders) -> Vec<OsString> {
    let mut args = Vec::new();
    push(&mut args, ["-J", "--no-playlist", "--no-warnings", "--no-check-certificate"]);
    push(&mut args, ["--user-agent", headers.user_agent.as_str()]);
    if let Some(ref referer) = headers.referer {
        push(&mut args, ["--referer", referer.as_str()]);
    }
    push(&mut args, [page_url]);
    args
}

fn resilient_input_args(args: &mut Vec<OsString>, headers: &RequestHeaders) {
    push(args, ["-http_persistent", "0", "-multiple_requests", "1", "-seekable", "0"]);
    push(args, ["-headers".to_string(), headers.to_header_block()]);
    push(
        args,
        [
            "-reconnect",
            "1",
            "-reconnect_at_eof",
            "1",
            "-reconnect_streamed",
            "1",
            "-reconnect_delay_max",
            "2",
            "-err_detect",
            "ignore_err",
            "-fflags",
            "+genpts+ignidx+igndts",
        ],
    );
}

/// First fallback pass: raw-copy the stream into time-boxed parts listed in
/// `list_path`, so no single output grows without bound.
pub fn fallback_split_args(
    stream_url: &str,
    parts_pattern: &Path,
    list_path: &Path,
    segment_secs: u64,
    headers: &RequestHeaders,
) -> Vec<OsString> {
    let mut args = Vec::new();
    push(&mut args, ["-y", "-hide_banner", "-nostdin"]);
    resilient_input_args(&mut args, headers);
    push(&mut args, ["-i", stream_url]);
    push(
        &mut args,
        [
            "-map",
            "0",
            "-c",
            "copy",
            "-bsf:a",
            "aac_adtstoasc",
            "-max_muxing_queue_size",
            "9999",
            "-max_error_rate",
            "1.0",
            "-avoid_negative_ts",
            "make_zero",
            "-f",
            "segment",
            "-reset_timestamps",
            "1",
            "-segment_list_type",
            "ffconcat",
        ],
    );
    push(&mut args, ["-segment_time".to_string(), segment_secs.to_string()]);
    push(&mut args, ["-segment_list"]);
    args.push(list_path.as_os_str().to_owned());
    args.push(parts_pattern.as_os_str().to_owned());
    args
}

/// Second fallback pass: join the parts into one faststart file.
pub fn fallback_join_args(list_path: &Path, output: &Path) -> Vec<OsString> {
    let mut args = Vec::new();
    push(&mut args, ["-y", "-hide_banner", "-nostdin", "-f", "concat", "-safe", "0", "-i"]);
    args.push(list_path.as_os_str().to_owned());
    push(&mut args, ["-c", "copy", "-movflags", "+faststart"]);
    args.push(output.as_os_str().to_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn generic_selector_falls_back_to_combined() {
        assert_eq!(
            format_selector(Some(720), false),
            "bestvideo[height<=720]+bestaudio/best[height<=720]/best"
        );
    }

    #[test]
    fn separate_av_selector_always_pairs_audio() {
        let s = format_selector(Some(1080), true);
        assert_eq!(s, "bestvideo[height<=1080]+bestaudio/bestvideo+bestaudio");
        for alternative in s.split('/') {
            assert!(alternative.contains("+bestaudio"));
        }
        assert!(format_selector(None, true).contains("+bestaudio"));
    }

    #[test]
    fn primary_args_carry_identity_and_output() {
        let headers = RequestHeaders::new("UA/2").with_referer("https://site.example/");
        let args = strings(&primary_args(
            "https://site.example/watch/1",
            Path::new("/tmp/job/output.mp4"),
            "best",
            &headers,
        ));
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--user-agent") + 1], "UA/2");
        assert_eq!(args[pos("--referer") + 1], "https://site.example/");
        assert_eq!(args[pos("--merge-output-format") + 1], "mp4");
        assert_eq!(args[pos("-o") + 1], "/tmp/job/output.mp4");
        assert_eq!(args.last().unwrap(), "https://site.example/watch/1");
    }

    #[test]
    fn split_args_put_input_options_before_input() {
        let headers = RequestHeaders::new("UA");
        let args = strings(&fallback_split_args(
            "https://cdn.example/master.m3u8",
            Path::new("/tmp/j/part_%03d.mp4"),
            Path::new("/tmp/j/parts.ffconcat"),
            600,
            &headers,
        ));
        let input = args.iter().position(|a| a == "-i").unwrap();
        let reconnect = args.iter().position(|a| a == "-reconnect").unwrap();
        let segment_time = args.iter().position(|a| a == "-segment_time").unwrap();
        assert!(reconnect < input);
        assert!(segment_time > input);
        assert_eq!(args[segment_time + 1], "600");
        assert_eq!(args.last().unwrap(), "/tmp/j/part_%03d.mp4");
    }
}
