use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::status::ParseStatusError;

/// Complexity of a work item, derived from the number of acceptance criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityClass {
    Simple,
    Medium,
    Complex,
}

impl ComplexityClass {
    /// `≤2 → Simple`, `3..=5 → Medium`, `≥6 → Complex`.
    pub fn from_criteria_count(count: usize) -> Self {
        match count {
            0..=2 => Self::Simple,
            3..=5 => Self::Medium,
            _ => Self::Complex,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
        }
    }

    pub fn all() -> [ComplexityClass; 3] {
        [Self::Simple, Self::Medium, Self::Complex]
    }
}

impl fmt::Display for ComplexityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplexityClass {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "medium" => Ok(Self::Medium),
            "complex" => Ok(Self::Complex),
            _ => Err(ParseStatusError {
                kind: "complexity",
                value: s.to_string(),
            }),
        }
    }
}

/// Longest wall-clock budget a plan may carry.
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

/// The bound set of roles and ceilings for a single run.
///
/// Produced by the plan table for a complexity class and never mutated after a
/// run binds it. A resumed run may carry raised ceilings, but that is a new
/// plan value bound to a new run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub complexity: ComplexityClass,
    pub workflow_type: String,
    /// Role identifiers, executed strictly in order.
    pub roles: Vec<String>,
    /// Role that takes over a step whose agent escalated or failed.
    #[serde(default)]
    pub fallback_role: Option<String>,
    /// Roles whose step may be skipped when the prompt cannot be fitted.
    #[serde(default)]
    pub optional_roles: Vec<String>,
    pub max_messages: u32,
    pub max_cost: f64,
    pub max_tokens: u64,
    pub max_duration_secs: u64,
}

impl ExecutionPlan {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    /// Problems with the budget ceilings. Empty when every ceiling is usable.
    pub fn ceiling_problems(&self) -> Vec<&'static str> {
        let mut problems = Vec::new();
        if self.max_messages == 0 {
            problems.push("max_messages must be positive");
        }
        if !self.max_cost.is_finite() || self.max_cost <= 0.0 {
            problems.push("max_cost must be positive");
        }
        if self.max_tokens == 0 {
            problems.push("max_tokens must be positive");
        } else if self.max_tokens > i64::MAX as u64 {
            problems.push("max_tokens is too large");
        }
        if self.max_duration_secs == 0 {
            problems.push("max_duration_secs must be positive");
        } else if self.max_duration_secs > MAX_DURATION_SECS {
            problems.push("max_duration_secs may not exceed 30 days");
        }
        problems
    }

    pub fn step_count(&self) -> usize {
        self.roles.len()
    }

    pub fn is_optional(&self, role: &str) -> bool {
        self.optional_roles.iter().any(|r| r == role)
    }

    /// Fallback for an escalated `role`. A role never falls back to itself.
    pub fn fallback_for(&self, role: &str) -> Option<&str> {
        self.fallback_role
            .as_deref()
            .filter(|fallback| *fallback != role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> ExecutionPlan {
        ExecutionPlan {
            complexity: ComplexityClass::Medium,
            workflow_type: "standard".to_string(),
            roles: vec!["planner".into(), "implementer".into(), "reviewer".into()],
            fallback_role: Some("planner".into()),
            optional_roles: vec!["reviewer".into()],
            max_messages: 40,
            max_cost: 3.0,
            max_tokens: 600_000,
            max_duration_secs: 3600,
        }
    }

    #[test]
    fn classification_boundaries() {
        assert_eq!(ComplexityClass::from_criteria_count(0), ComplexityClass::Simple);
        assert_eq!(ComplexityClass::from_criteria_count(2), ComplexityClass::Simple);
        assert_eq!(ComplexityClass::from_criteria_count(3), ComplexityClass::Medium);
        assert_eq!(ComplexityClass::from_criteria_count(5), ComplexityClass::Medium);
        assert_eq!(ComplexityClass::from_criteria_count(6), ComplexityClass::Complex);
        assert_eq!(ComplexityClass::from_criteria_count(40), ComplexityClass::Complex);
    }

    #[test]
    fn fallback_never_points_at_same_role() {
        let plan = plan();
        assert_eq!(plan.fallback_for("implementer"), Some("planner"));
        assert_eq!(plan.fallback_for("planner"), None);
    }

    #[test]
    fn optional_roles_lookup() {
        let plan = plan();
        assert!(plan.is_optional("reviewer"));
        assert!(!plan.is_optional("implementer"));
        assert_eq!(plan.max_duration(), Duration::from_secs(3600));
    }

    #[test]
    fn ceiling_problems_reject_unusable_values() {
        assert!(plan().ceiling_problems().is_empty());

        let mut bad = plan();
        bad.max_cost = f64::NAN;
        bad.max_duration_secs = u64::MAX;
        bad.max_messages = 0;
        let problems = bad.ceiling_problems();
        assert_eq!(problems.len(), 3);
        assert!(problems.contains(&"max_cost must be positive"));
        assert!(problems.contains(&"max_duration_secs may not exceed 30 days"));

        let mut infinite = plan();
        infinite.max_cost = f64::INFINITY;
        assert_eq!(infinite.ceiling_problems(), vec!["max_cost must be positive"]);
    }

    #[test]
    fn complexity_parses_case_insensitively() {
        assert_eq!("COMPLEX".parse::<ComplexityClass>().unwrap(), ComplexityClass::Complex);
        assert!("huge".parse::<ComplexityClass>().is_err());
    }
}
