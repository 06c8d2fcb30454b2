//! Completion promise detection.
//!
//! The agent signals genuine completion by emitting `<promise>TEXT</promise>`
//! anywhere in its output. Matching is exact on the trimmed payload. The
//! `regex` crate guarantees linear-time matching, so arbitrarily large or
//! adversarial output cannot trigger catastrophic backtracking.

use std::sync::LazyLock;

use regex::Regex;

const OPEN_TAG: &str = "<promise>";

static PROMISE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<promise>(.*?)</promise>").expect("valid promise regex"));

/// Return true if `output` contains `<promise>` + `promise` + `</promise>`.
///
/// Whitespace (including newlines) around the payload inside the tags is
/// ignored; anything else must match exactly. A blank `promise` never matches.
pub fn detect(output: &str, promise: &str) -> bool {
    let expected = promise.trim();
    if expected.is_empty() {
        return false;
    }
    PROMISE_RE.captures_iter(output).any(|caps| {
        let inner = caps.get(1).map_or("", |m| m.as_str());
        // An unclosed `<promise>` earlier in the text swallows the real tag's
        // opener into the capture; only the text after the last opener counts.
        let payload = inner.rsplit(OPEN_TAG).next().unwrap_or(inner);
        payload.trim() == expected
    })
}

/// Like [`detect`], but a loop without a configured promise never completes textually.
pub fn detect_configured(output: &str, promise: Option<&str>) -> bool {
    promise.is_some_and(|promise| detect(output, promise))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_tag_surrounded_by_newlines() {
        assert!(detect("\n<promise>DONE</promise>\n", "DONE"));
    }

    #[test]
    fn trims_whitespace_inside_tag() {
        assert!(detect(
            "prefix text <promise> DONE </promise> suffix",
            "DONE"
        ));
        assert!(detect("<promise>\n  ALL TESTS PASS\n</promise>", "ALL TESTS PASS"));
    }

    #[test]
    fn rejects_partial_payload() {
        assert!(!detect("<promise>DONEX</promise>", "DONE"));
        assert!(!detect("<promise>DON</promise>", "DONE"));
        assert!(!detect("<promise>done</promise>", "DONE"));
    }

    #[test]
    fn finds_promise_in_middle_of_multiline_output() {
        let output = "Ran the suite.\nAll green.\n<promise>DONE</promise>\nWrapping up.\n";
        assert!(detect(output, "DONE"));
    }

    #[test]
    fn later_tag_matches_after_non_matching_one() {
        let output = "<promise>not yet</promise> ... <promise>DONE</promise>";
        assert!(detect(output, "DONE"));
    }

    #[test]
    fn unclosed_opener_does_not_hide_real_tag() {
        let output = "I will print <promise> when done.\n<promise>DONE</promise>";
        assert!(detect(output, "DONE"));
    }

    #[test]
    fn bare_promise_text_is_not_a_signal() {
        assert!(!detect("DONE", "DONE"));
        assert!(!detect("<promise>DONE", "DONE"));
    }

    #[test]
    fn blank_or_missing_promise_never_matches() {
        assert!(!detect("<promise></promise>", ""));
        assert!(!detect("<promise>DONE</promise>", "   "));
        assert!(!detect_configured("<promise>DONE</promise>", None));
        assert!(detect_configured("<promise>DONE</promise>", Some("DONE")));
    }

    #[test]
    fn large_adversarial_input_completes() {
        let mut output = "<promise>".repeat(50_000);
        output.push_str(&"x".repeat(200_000));
        assert!(!detect(&output, "DONE"));
        output.push_str("<promise>DONE</promise>");
        assert!(detect(&output, "DONE"));
    }
}
