//! Neutralizing untrusted build output before it reaches task descriptions
//! and pull-request bodies.
//!
//! Error messages and logs come straight from CI and may contain terminal
//! escapes, control bytes or markdown that would break out of the block we
//! embed it in. Everything external goes through [`safe_text`] (or
//! [`safe_tail`] for logs) and is then embedded with [`indent_block`], which
//! renders as a code block without relying on backtick fences.

use regex::Regex;
use std::sync::LazyLock;

/// ANSI CSI and OSC escape sequences.
static ANSI_ESCAPES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)").unwrap()
});

/// Runs of three or more backticks (a markdown fence).
static FENCE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`{3,}").unwrap());

/// Marker placed where text was cut.
pub const TRUNCATION_MARKER: &str = "...";

/// Remove escape sequences and control characters, keeping newlines and tabs.
#[must_use]
pub fn strip_control(input: &str) -> String {
    let without_escapes = ANSI_ESCAPES.replace_all(input, "");
    without_escapes
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect()
}

/// Break every backtick fence so the text cannot open or close a code block.
#[must_use]
pub fn neutralize_fences(input: &str) -> String {
    FENCE_RUNS
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let run = caps[0].chars().count();
            vec!["`"; run].join(" ")
        })
        .into_owned()
}

/// Keep at most `max_chars` characters from the start, marker included.
#[must_use]
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        return input.chars().take(max_chars).collect();
    }
    let mut out: String = input.chars().take(max_chars - marker_len).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Keep at most `max_chars` characters from the end, marker included.
#[must_use]
pub fn tail_chars(input: &str, max_chars: usize) -> String {
    let total = input.chars().count();
    if total <= max_chars {
        return input.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        return input.chars().skip(total - max_chars).collect();
    }
    let keep = max_chars - marker_len;
    let mut out = String::from(TRUNCATION_MARKER);
    out.extend(input.chars().skip(total - keep));
    out
}

/// Sanitized, length-capped prefix of untrusted text.
#[must_use]
pub fn safe_text(input: &str, max_chars: usize) -> String {
    truncate_chars(&neutralize_fences(&strip_control(input)), max_chars)
}

/// Sanitized, length-capped suffix of untrusted text (logs end with the
/// interesting part).
#[must_use]
pub fn safe_tail(input: &str, max_chars: usize) -> String {
    tail_chars(&neutralize_fences(&strip_control(input)), max_chars)
}

/// Single-line variant for metadata fields (branch, workflow, job names).
#[must_use]
pub fn safe_inline(input: &str, max_chars: usize) -> String {
    let flattened: String = safe_text(input, max_chars)
        .chars()
        .map(|c| if matches!(c, '\n' | '\t') { ' ' } else { c })
        .collect();
    flattened.trim().to_string()
}

/// Indent every line by four spaces so markdown renders it as code.
#[must_use]
pub fn indent_block(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
