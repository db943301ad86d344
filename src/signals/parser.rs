//! Signal parsing from agent output.
//!
//! Extracts control signals using regex patterns for:
//! - `<escalate>reason</escalate>` (and the `<blocker>` alias)
//! - `<summary>text</summary>`

use super::types::{EscalationSignal, StepSignals};
use regex::Regex;
use std::sync::LazyLock;

// Compile regexes once using LazyLock
static ESCALATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(escalate|blocker)>(.*?)</(?:escalate|blocker)>")
        .expect("escalate regex is valid")
});

static SUMMARY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<summary>\s*(.*?)\s*</summary>").expect("summary regex is valid")
});

/// Extract all signals from the given text.
pub fn extract_signals(text: &str) -> StepSignals {
    let mut signals = StepSignals::new();

    for cap in ESCALATE_REGEX.captures_iter(text) {
        if let Some(reason_match) = cap.get(2) {
            let reason = reason_match.as_str().trim();
            let reason = if reason.is_empty() {
                "no reason given"
            } else {
                reason
            };
            tracing::debug!(tag = &cap[1], reason, "Escalation signal");
            signals.escalations.push(EscalationSignal::new(reason));
        }
    }

    signals.summary = SUMMARY_REGEX
        .captures_iter(text)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
        .last();

    signals
}

/// Output text with signal tags removed, for summaries and artifacts.
pub fn strip_signals(text: &str) -> String {
    let without_escalations = ESCALATE_REGEX.replace_all(text, "");
    SUMMARY_REGEX
        .replace_all(&without_escalations, "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_escalate() {
        let signals = extract_signals("Tried twice. <escalate>Need a schema decision</escalate>");
        assert_eq!(signals.escalations.len(), 1);
        assert_eq!(signals.escalations[0].reason, "Need a schema decision");
    }

    #[test]
    fn test_parse_blocker_alias() {
        let signals = extract_signals("<blocker>  Missing credentials  </blocker>");
        assert_eq!(signals.escalation_reason().as_deref(), Some("Missing credentials"));
    }

    #[test]
    fn test_empty_escalation_still_escalates() {
        let signals = extract_signals("<escalate></escalate>");
        assert!(signals.has_escalation());
        assert_eq!(signals.escalations[0].reason, "no reason given");
    }

    #[test]
    fn test_multiline_summary_takes_last() {
        let text = "<summary>first</summary>\nwork\n<summary>\nPatched the\nredirect.\n</summary>";
        let signals = extract_signals(text);
        assert_eq!(signals.summary.as_deref(), Some("Patched the\nredirect."));
        assert!(!signals.has_escalation());
    }

    #[test]
    fn test_no_signals() {
        let signals = extract_signals("plain output, nothing tagged");
        assert_eq!(signals, StepSignals::default());
    }

    #[test]
    fn test_strip_signals() {
        let stripped = strip_signals("diff here\n<summary>did it</summary>\n<escalate>x</escalate>");
        assert_eq!(stripped, "diff here");
    }
}
