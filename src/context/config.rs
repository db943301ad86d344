//! Safety buffer parsing.

use crate::errors::ContextError;

/// Headroom kept free below the model's context window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SafetyBuffer {
    /// Percentage of the context window (e.g., 10%)
    Percentage(f32),
    /// Absolute token count
    Absolute(usize),
}

impl SafetyBuffer {
    /// Buffer size in tokens for a given window.
    pub fn tokens(&self, context_window: usize) -> usize {
        match self {
            SafetyBuffer::Percentage(pct) => {
                ((context_window as f64) * (*pct as f64 / 100.0)).ceil() as usize
            }
            SafetyBuffer::Absolute(tokens) => *tokens,
        }
    }

    /// Usable prompt budget: the window minus the buffer.
    pub fn limit(&self, context_window: usize) -> Result<usize, ContextError> {
        let buffer = self.tokens(context_window);
        if buffer >= context_window {
            return Err(ContextError::BufferExceedsWindow {
                buffer,
                window: context_window,
            });
        }
        Ok(context_window - buffer)
    }
}

impl Default for SafetyBuffer {
    fn default() -> Self {
        SafetyBuffer::Percentage(10.0)
    }
}

impl std::fmt::Display for SafetyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyBuffer::Percentage(pct) => write!(f, "{}%", pct),
            SafetyBuffer::Absolute(tokens) => write!(f, "{}", tokens),
        }
    }
}

impl std::str::FromStr for SafetyBuffer {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_safety_buffer(s)
    }
}

/// Parse a safety buffer string.
///
/// Accepts a percentage of the window (`"10%"`, `"12.5%"`) or an absolute
/// token count (`"8000"`). Zero is allowed; 100% or more is not.
pub fn parse_safety_buffer(s: &str) -> Result<SafetyBuffer, ContextError> {
    let s = s.trim();
    let invalid = |reason: &str| ContextError::InvalidSafetyBuffer {
        value: s.to_string(),
        reason: reason.to_string(),
    };

    if s.is_empty() {
        return Err(invalid("value cannot be empty"));
    }

    if let Some(num_str) = s.strip_suffix('%') {
        let pct: f32 = num_str
            .trim()
            .parse()
            .map_err(|_| invalid("not a number"))?;
        if !(0.0..100.0).contains(&pct) {
            return Err(invalid("percentage must be at least 0 and below 100"));
        }
        Ok(SafetyBuffer::Percentage(pct))
    } else {
        let tokens: usize = s.parse().map_err(|_| invalid("not a token count"))?;
        Ok(SafetyBuffer::Absolute(tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_percentage() {
        assert_eq!(parse_safety_buffer("10%").unwrap(), SafetyBuffer::Percentage(10.0));
        assert_eq!(parse_safety_buffer(" 12.5% ").unwrap(), SafetyBuffer::Percentage(12.5));
        assert_eq!(parse_safety_buffer("0%").unwrap(), SafetyBuffer::Percentage(0.0));
    }

    #[test]
    fn test_parse_absolute() {
        assert_eq!(parse_safety_buffer("8000").unwrap(), SafetyBuffer::Absolute(8000));
        assert_eq!(parse_safety_buffer("0").unwrap(), SafetyBuffer::Absolute(0));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_safety_buffer("").is_err());
        assert!(parse_safety_buffer("lots").is_err());
        assert!(parse_safety_buffer("100%").is_err());
        assert!(parse_safety_buffer("-5%").is_err());
        assert!(parse_safety_buffer("-5").is_err());
    }

    #[test]
    fn test_limit_subtracts_buffer() {
        assert_eq!(SafetyBuffer::Percentage(10.0).limit(200_000).unwrap(), 180_000);
        assert_eq!(SafetyBuffer::Absolute(1_000).limit(4_000).unwrap(), 3_000);
    }

    #[test]
    fn test_limit_rejects_buffer_larger_than_window() {
        let err = SafetyBuffer::Absolute(5_000).limit(4_000).unwrap_err();
        assert_eq!(
            err,
            ContextError::BufferExceedsWindow {
                buffer: 5_000,
                window: 4_000
            }
        );
    }

    #[test]
    fn test_display_round_trips() {
        let buffer: SafetyBuffer = "15%".parse().unwrap();
        assert_eq!(buffer.to_string(), "15%");
        assert_eq!(SafetyBuffer::Absolute(42).to_string(), "42");
    }
}
