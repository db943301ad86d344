//! Fitting prompt sections into the usable context window.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use steward_common::{ShrinkAction, ShrinkRecord};

use super::config::SafetyBuffer;
use super::estimate_tokens;
use super::section::{Section, SectionKind, assemble};
use crate::errors::ContextError;
use crate::util::{head_tail_excerpt, keep_tail};

/// Summaries shorter than this are dropped rather than truncated again.
const MIN_SUMMARY_BYTES: usize = 200;

/// Tunables for the shrink loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GovernorSettings {
    /// Shrink actions tried before the call is skipped.
    pub max_shrink_attempts: u32,
    /// Bytes kept when a code excerpt is reduced to its head and tail.
    pub excerpt_keep_chars: usize,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            max_shrink_attempts: super::DEFAULT_MAX_SHRINK_ATTEMPTS,
            excerpt_keep_chars: super::DEFAULT_EXCERPT_KEEP_CHARS,
        }
    }
}

/// Result of fitting one prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    /// The prompt fits. `estimated_tokens` never exceeds the limit.
    Fitted {
        prompt: String,
        estimated_tokens: usize,
        shrink_log: Vec<ShrinkRecord>,
    },
    /// The prompt could not be made to fit; the call must not be sent.
    Skipped {
        estimated_tokens: usize,
        limit: usize,
        shrink_log: Vec<ShrinkRecord>,
        reason: String,
    },
}

impl FitOutcome {
    pub fn shrink_log(&self) -> &[ShrinkRecord] {
        match self {
            FitOutcome::Fitted { shrink_log, .. } | FitOutcome::Skipped { shrink_log, .. } => {
                shrink_log
            }
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, FitOutcome::Skipped { .. })
    }
}

/// Shrinks prompt sections until they fit below `window - safety_buffer`.
///
/// Stateless between calls; each run owns its own instance.
#[derive(Debug, Clone)]
pub struct ContextGovernor {
    safety_buffer: SafetyBuffer,
    settings: GovernorSettings,
}

impl ContextGovernor {
    pub fn new(safety_buffer: SafetyBuffer, settings: GovernorSettings) -> Self {
        Self {
            safety_buffer,
            settings,
        }
    }

    pub fn limit(&self, context_window: usize) -> Result<usize, ContextError> {
        self.safety_buffer.limit(context_window)
    }

    /// Fit `sections` into `context_window` tokens.
    ///
    /// Shrink order: oldest history first, then code excerpts (reduced to a
    /// head/tail excerpt, then dropped, largest first), then the running
    /// summary (truncated, then dropped). System and task sections are never
    /// touched.
    pub fn fit(
        &self,
        sections: Vec<Section>,
        context_window: usize,
    ) -> Result<FitOutcome, ContextError> {
        let limit = self.limit(context_window)?;
        let mut shrinker = Shrinker {
            sections,
            excerpted: HashSet::new(),
            keep_chars: self.settings.excerpt_keep_chars,
        };
        let mut shrink_log = Vec::new();
        let mut attempts = 0u32;

        loop {
            let prompt = assemble(&shrinker.sections);
            let estimated_tokens = estimate_tokens(&prompt);
            if estimated_tokens <= limit {
                return Ok(FitOutcome::Fitted {
                    prompt,
                    estimated_tokens,
                    shrink_log,
                });
            }
            if attempts >= self.settings.max_shrink_attempts {
                return Ok(FitOutcome::Skipped {
                    estimated_tokens,
                    limit,
                    shrink_log,
                    reason: format!(
                        "prompt of ~{} tokens still exceeds the {}-token limit after {} shrink attempts",
                        estimated_tokens, limit, attempts
                    ),
                });
            }
            match shrinker.shrink_once() {
                Some(record) => {
                    tracing::debug!(
                        section = %record.section_id,
                        action = ?record.action,
                        from = record.original_tokens,
                        to = record.reduced_tokens,
                        "Shrunk prompt section"
                    );
                    shrink_log.push(record);
                    attempts += 1;
                }
                None => {
                    return Ok(FitOutcome::Skipped {
                        estimated_tokens,
                        limit,
                        shrink_log,
                        reason: format!(
                            "prompt of ~{} tokens exceeds the {}-token limit and nothing is left to shrink",
                            estimated_tokens, limit
                        ),
                    });
                }
            }
        }
    }
}

struct Shrinker {
    sections: Vec<Section>,
    /// Excerpts already reduced to head/tail form.
    excerpted: HashSet<String>,
    keep_chars: usize,
}

impl Shrinker {
    fn shrink_once(&mut self) -> Option<ShrinkRecord> {
        self.drop_oldest_history()
            .or_else(|| self.excerpt_largest_code())
            .or_else(|| self.drop_largest_code())
            .or_else(|| self.truncate_summary())
    }

    fn drop_oldest_history(&mut self) -> Option<ShrinkRecord> {
        let index = self
            .sections
            .iter()
            .position(|s| s.kind == SectionKind::History)?;
        let removed = self.sections.remove(index);
        Some(record(&removed, ShrinkAction::Dropped, 0))
    }

    fn excerpt_largest_code(&mut self) -> Option<ShrinkRecord> {
        let keep = self.keep_chars;
        let section = self
            .sections
            .iter_mut()
            .filter(|s| s.kind == SectionKind::CodeExcerpt)
            .filter(|s| !self.excerpted.contains(&s.id))
            .filter(|s| head_tail_excerpt(&s.content, keep).len() < s.content.len())
            .max_by_key(|s| s.content.len())?;
        let original = estimate_tokens(&section.content);
        section.content = head_tail_excerpt(&section.content, keep);
        self.excerpted.insert(section.id.clone());
        Some(ShrinkRecord {
            section_id: section.id.clone(),
            action: ShrinkAction::Summarized,
            original_tokens: original,
            reduced_tokens: estimate_tokens(&section.content),
        })
    }

    fn drop_largest_code(&mut self) -> Option<ShrinkRecord> {
        let index = self
            .sections
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == SectionKind::CodeExcerpt)
            .max_by_key(|(_, s)| s.content.len())
            .map(|(i, _)| i)?;
        let removed = self.sections.remove(index);
        Some(record(&removed, ShrinkAction::Dropped, 0))
    }

    fn truncate_summary(&mut self) -> Option<ShrinkRecord> {
        let index = self
            .sections
            .iter()
            .position(|s| s.kind == SectionKind::Summary)?;
        if self.sections[index].content.len() < MIN_SUMMARY_BYTES {
            let removed = self.sections.remove(index);
            return Some(record(&removed, ShrinkAction::Dropped, 0));
        }
        let section = &mut self.sections[index];
        let original = estimate_tokens(&section.content);
        section.content = keep_tail(&section.content, section.content.len() / 2);
        Some(ShrinkRecord {
            section_id: section.id.clone(),
            action: ShrinkAction::Truncated,
            original_tokens: original,
            reduced_tokens: estimate_tokens(&section.content),
        })
    }
}

fn record(section: &Section, action: ShrinkAction, reduced_tokens: usize) -> ShrinkRecord {
    ShrinkRecord {
        section_id: section.id.clone(),
        action,
        original_tokens: estimate_tokens(&section.content),
        reduced_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(max_attempts: u32) -> ContextGovernor {
        ContextGovernor::new(
            SafetyBuffer::Absolute(0),
            GovernorSettings {
                max_shrink_attempts: max_attempts,
                excerpt_keep_chars: 400,
            },
        )
    }

    fn base_sections() -> Vec<Section> {
        vec![Section::system("You are the implementer."), Section::task("Fix login.")]
    }

    #[test]
    fn small_prompt_fits_without_shrinking() {
        let outcome = governor(6).fit(base_sections(), 1_000).unwrap();
        match outcome {
            FitOutcome::Fitted {
                shrink_log,
                estimated_tokens,
                prompt,
            } => {
                assert!(shrink_log.is_empty());
                assert!(estimated_tokens <= 1_000);
                assert!(prompt.contains("Fix login."));
            }
            other => panic!("expected fitted, got {:?}", other),
        }
    }

    #[test]
    fn oldest_history_is_dropped_first() {
        let mut sections = base_sections();
        sections.push(Section::history("history-0", "Planner output", "p".repeat(2_000)));
        sections.push(Section::history("history-1", "Implementer output", "i".repeat(400)));
        sections.push(Section::excerpt("code-1", "Patch", "c".repeat(400)));

        let outcome = governor(6).fit(sections, 500).unwrap();
        let log = outcome.shrink_log();
        assert_eq!(log[0].section_id, "history-0");
        assert_eq!(log[0].action, ShrinkAction::Dropped);
        assert!(!outcome.is_skipped());
    }

    #[test]
    fn code_excerpt_is_summarized_before_dropped() {
        let mut sections = base_sections();
        sections.push(Section::excerpt("code-1", "Patch", "x".repeat(8_000)));

        let outcome = governor(6).fit(sections, 300).unwrap();
        let log = outcome.shrink_log();
        assert_eq!(log[0].section_id, "code-1");
        assert_eq!(log[0].action, ShrinkAction::Summarized);
        assert!(log[0].reduced_tokens < log[0].original_tokens);
        match outcome {
            FitOutcome::Fitted { prompt, .. } => assert!(prompt.contains("bytes elided")),
            other => panic!("expected fitted, got {:?}", other),
        }
    }

    #[test]
    fn summary_is_truncated_after_code() {
        let mut sections = base_sections();
        sections.insert(1, Section::summary("s".repeat(4_000)));
        sections.push(Section::excerpt("code-1", "Patch", "x".repeat(100)));

        let outcome = governor(6).fit(sections, 700).unwrap();
        let actions: Vec<_> = outcome
            .shrink_log()
            .iter()
            .map(|r| (r.section_id.as_str(), r.action))
            .collect();
        assert_eq!(actions[0], ("code-1", ShrinkAction::Dropped));
        assert_eq!(actions[1], ("summary", ShrinkAction::Truncated));
        assert!(!outcome.is_skipped());
    }

    #[test]
    fn protected_sections_are_never_dropped() {
        let sections = vec![
            Section::system("s".repeat(4_000)),
            Section::task("t".repeat(4_000)),
        ];
        let outcome = governor(6).fit(sections, 1_000).unwrap();
        match outcome {
            FitOutcome::Skipped {
                shrink_log, reason, ..
            } => {
                assert!(shrink_log.is_empty());
                assert!(reason.contains("nothing is left to shrink"));
            }
            other => panic!("expected skipped, got {:?}", other),
        }
    }

    #[test]
    fn attempts_are_capped() {
        let mut sections = base_sections();
        for i in 0..10 {
            sections.push(Section::history(format!("history-{}", i), "Old", "h".repeat(1_000)));
        }
        let outcome = governor(3).fit(sections, 500).unwrap();
        match outcome {
            FitOutcome::Skipped { shrink_log, .. } => assert_eq!(shrink_log.len(), 3),
            other => panic!("expected skipped, got {:?}", other),
        }
    }

    #[test]
    fn fitted_prompt_never_exceeds_limit() {
        // Sweep limits across a mixed prompt; every Fitted result must be within the limit.
        for limit in (50..3_000).step_by(137) {
            let mut sections = base_sections();
            sections.insert(1, Section::summary("s".repeat(1_500)));
            sections.push(Section::history("history-0", "Plan", "p".repeat(2_500)));
            sections.push(Section::excerpt("code-0", "Patch", "c".repeat(6_000)));
            sections.push(Section::excerpt("code-1", "Tests", "t".repeat(3_000)));

            match governor(6).fit(sections, limit).unwrap() {
                FitOutcome::Fitted {
                    prompt,
                    estimated_tokens,
                    ..
                } => {
                    assert!(estimated_tokens <= limit);
                    assert_eq!(estimate_tokens(&prompt), estimated_tokens);
                }
                FitOutcome::Skipped { .. } => {}
            }
        }
    }

    #[test]
    fn percentage_buffer_reduces_limit() {
        let governor = ContextGovernor::new(SafetyBuffer::Percentage(10.0), GovernorSettings::default());
        assert_eq!(governor.limit(200_000).unwrap(), 180_000);
    }
}
