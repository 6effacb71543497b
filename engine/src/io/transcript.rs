//! Transcript files on disk.
//!
//! The assistant may report a subagent finished before its transcript is fully
//! flushed, so reads poll with a bounded retry budget and settle for the best
//! parse available.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::core::transcript::flatten_text;

/// Expand a leading `~` to `$HOME`.
pub fn expand_home(raw: &str) -> PathBuf {
    match (raw.strip_prefix('~'), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => {
            let mut path = PathBuf::from(home);
            let rest = rest.trim_start_matches('/');
            if !rest.is_empty() {
                path.push(rest);
            }
            path
        }
        _ => PathBuf::from(raw),
    }
}

/// Raw transcript content; empty when the path is blank or unreadable.
pub fn read_raw(raw_path: &str) -> String {
    if raw_path.trim().is_empty() {
        return String::new();
    }
    let path = expand_home(raw_path);
    match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "transcript unreadable");
            String::new()
        }
    }
}

/// Poll a transcript until `marker` appears in its flattened text, or (without
/// a marker) until its size is stable and the text is non-empty. Returns the
/// last parse once `max_retries` is exhausted.
pub fn read_with_retry(
    raw_path: &str,
    marker: Option<&Regex>,
    max_retries: u32,
    delay: Duration,
) -> String {
    if raw_path.trim().is_empty() {
        return String::new();
    }
    let path = expand_home(raw_path);
    if !path.exists() {
        warn!(path = %path.display(), "transcript missing");
        return String::new();
    }

    let mut last_size = None;
    let mut text = String::new();
    for attempt in 0..=max_retries {
        let size = fs::metadata(&path).map(|meta| meta.len()).ok();
        text = fs::read_to_string(&path)
            .map(|content| flatten_text(&content))
            .unwrap_or_default();

        match marker {
            Some(marker) if marker.is_match(&text) => return text,
            None if size.is_some() && size == last_size && !text.is_empty() => return text,
            _ => {}
        }
        last_size = size;

        if attempt < max_retries {
            debug!(attempt, path = %path.display(), "transcript not settled, retrying");
            thread::sleep(delay);
        }
    }

    if marker.is_some() {
        warn!(path = %path.display(), "marker never appeared in transcript");
    }
    text
}

/// Content of a side file that an oversized tool result was spilled into.
pub fn read_side_file(raw_path: &str) -> Option<String> {
    let path = expand_home(raw_path);
    fs::read_to_string(&path)
        .inspect_err(|err| warn!(path = %path.display(), err = %err, "side file unreadable"))
        .ok()
}

/// Whether a transcript path exists after `~` expansion.
pub fn exists(raw_path: &str) -> bool {
    !raw_path.trim().is_empty() && Path::new(&expand_home(raw_path)).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant_line(text: &str) -> String {
        serde_json::json!({"message": {"content": [{"type": "text", "text": text}]}}).to_string()
    }

    #[test]
    fn marker_present_returns_immediately() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("t.jsonl");
        fs::write(&path, assistant_line("CRITICAL_COUNT: 0") + "\n").expect("write");

        let marker = Regex::new(r"CRITICAL_COUNT:\s*\d+").expect("regex");
        let text = read_with_retry(
            path.to_str().expect("utf8"),
            Some(&marker),
            5,
            Duration::from_secs(10),
        );
        assert_eq!(text, "CRITICAL_COUNT: 0");
    }

    #[test]
    fn missing_marker_returns_best_parse_after_budget() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("t.jsonl");
        fs::write(&path, assistant_line("no summary") + "\n{truncated").expect("write");

        let marker = Regex::new(r"CRITICAL_COUNT:\s*\d+").expect("regex");
        let text = read_with_retry(
            path.to_str().expect("utf8"),
            Some(&marker),
            2,
            Duration::from_millis(1),
        );
        assert_eq!(text, "no summary");
    }

    #[test]
    fn blank_or_missing_path_reads_empty() {
        assert_eq!(read_with_retry("", None, 1, Duration::from_millis(1)), "");
        assert_eq!(
            read_with_retry("/nonexistent/t.jsonl", None, 1, Duration::from_millis(1)),
            ""
        );
        assert_eq!(read_raw(""), "");
    }

    #[test]
    fn tilde_expands_to_home() {
        let Some(home) = std::env::var_os("HOME") else {
            return;
        };
        assert_eq!(expand_home("~/x/t.jsonl"), PathBuf::from(home).join("x/t.jsonl"));
        assert_eq!(expand_home("/abs"), PathBuf::from("/abs"));
    }
}
