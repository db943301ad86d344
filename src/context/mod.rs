//! Context Governor
//!
//! Keeps every prompt inside the model's context window. A prompt is built
//! from typed [`Section`]s; when the estimate is over the usable limit the
//! governor shrinks the least valuable sections first and logs each decision,
//! so the ledger can show exactly what a model did not get to see.
//!
//! ## Configuration
//!
//! ```toml
//! [model]
//! context_window = 200000
//! safety_buffer = "10%"     # or an absolute token count
//!
//! [governor]
//! max_shrink_attempts = 6
//! excerpt_keep_chars = 2000
//! ```

mod config;
mod governor;
mod section;

pub use config::{SafetyBuffer, parse_safety_buffer};
pub use governor::{ContextGovernor, FitOutcome, GovernorSettings};
pub use section::{Section, SectionKind, assemble};

/// Rough characters-per-token ratio used for estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Default context window of the configured model, in tokens.
pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

pub const DEFAULT_MAX_SHRINK_ATTEMPTS: u32 = 6;

pub const DEFAULT_EXCERPT_KEEP_CHARS: usize = 2_000;

/// Estimated token count of `text` (~4 bytes per token, rounded up).
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
