//! Completion-promise detection
//!
//! An agent signals it is done by emitting `<promise>TOKEN</promise>`. Only the
//! first tag in the text counts; markers match case-insensitively and the
//! interior may span lines.

use std::sync::LazyLock;

use regex::Regex;

static PROMISE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<promise>(.*?)</promise>").expect("promise pattern is a valid regex"));

/// Interior of the first promise tag, untrimmed
pub fn extract(output: &str) -> Option<&str> {
    PROMISE_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Whether the first promise tag carries `expected` (trimmed, case-folded)
pub fn detect(output: &str, expected: &str) -> bool {
    match extract(output) {
        Some(interior) => interior.trim().to_lowercase() == expected.trim().to_lowercase(),
        None => false,
    }
}
