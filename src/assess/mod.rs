//! Complexity Assessor
//!
//! Classifies a work item by its number of acceptance criteria and looks up
//! the execution plan for that class. Pure: no I/O, no clock.
//!
//! The lookup table has built-in defaults and can be overridden per class in
//! `steward.toml`:
//!
//! ```toml
//! [plans.simple]
//! max_cost = 1.5
//!
//! [plans.complex]
//! roles = ["planner", "implementer", "reviewer", "tester"]
//! fallback_role = "planner"
//! ```

use serde::{Deserialize, Serialize};
use steward_common::{ComplexityClass, ExecutionPlan, WorkItem};

/// Complexity class of a work item.
pub fn assess(item: &WorkItem) -> ComplexityClass {
    ComplexityClass::from_criteria_count(item.criteria_count())
}

/// Classification plus the plan it routes to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub item_id: String,
    pub criteria_count: usize,
    pub complexity: ComplexityClass,
    pub plan: ExecutionPlan,
}

/// Lookup from complexity class to execution plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanTable {
    simple: ExecutionPlan,
    medium: ExecutionPlan,
    complex: ExecutionPlan,
}

fn roles(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl Default for PlanTable {
    fn default() -> Self {
        Self {
            simple: ExecutionPlan {
                complexity: ComplexityClass::Simple,
                workflow_type: "quick_fix".to_string(),
                roles: roles(&["implementer", "tester"]),
                fallback_role: None,
                optional_roles: Vec::new(),
                max_messages: 20,
                max_cost: 1.0,
                max_tokens: 200_000,
                max_duration_secs: 1800,
            },
            medium: ExecutionPlan {
                complexity: ComplexityClass::Medium,
                workflow_type: "standard".to_string(),
                roles: roles(&["planner", "implementer", "reviewer", "tester"]),
                fallback_role: Some("planner".to_string()),
                optional_roles: roles(&["reviewer"]),
                max_messages: 40,
                max_cost: 3.0,
                max_tokens: 600_000,
                max_duration_secs: 3600,
            },
            complex: ExecutionPlan {
                complexity: ComplexityClass::Complex,
                workflow_type: "full_cycle".to_string(),
                roles: roles(&[
                    "planner",
                    "implementer",
                    "reviewer",
                    "implementer",
                    "tester",
                    "reviewer",
                ]),
                fallback_role: Some("planner".to_string()),
                optional_roles: roles(&["reviewer"]),
                max_messages: 80,
                max_cost: 8.0,
                max_tokens: 1_500_000,
                max_duration_secs: 7200,
            },
        }
    }
}

impl PlanTable {
    /// Built-in defaults with `overrides` applied on top.
    pub fn from_overrides(overrides: &PlanOverrides) -> Self {
        let mut table = Self::default();
        for class in ComplexityClass::all() {
            if let Some(o) = overrides.for_class(class) {
                o.apply(table.slot_mut(class));
            }
        }
        table
    }

    /// Plan bound to a new run of the given class.
    pub fn plan_for(&self, class: ComplexityClass) -> ExecutionPlan {
        match class {
            ComplexityClass::Simple => self.simple.clone(),
            ComplexityClass::Medium => self.medium.clone(),
            ComplexityClass::Complex => self.complex.clone(),
        }
    }

    pub fn assess(&self, item: &WorkItem) -> Assessment {
        let complexity = assess(item);
        Assessment {
            item_id: item.id.clone(),
            criteria_count: item.criteria_count(),
            complexity,
            plan: self.plan_for(complexity),
        }
    }

    fn slot_mut(&mut self, class: ComplexityClass) -> &mut ExecutionPlan {
        match class {
            ComplexityClass::Simple => &mut self.simple,
            ComplexityClass::Medium => &mut self.medium,
            ComplexityClass::Complex => &mut self.complex,
        }
    }

    /// Problems with the table. Empty when every plan is usable.
    pub fn validate(&self, known_roles: &[&str]) -> Vec<String> {
        let mut problems = Vec::new();
        for class in ComplexityClass::all() {
            let plan = self.plan_for(class);
            if plan.roles.is_empty() {
                problems.push(format!("plans.{}: roles must not be empty", class));
            }
            let referenced = plan
                .roles
                .iter()
                .chain(plan.fallback_role.iter())
                .chain(plan.optional_roles.iter());
            for role in referenced {
                if !known_roles.contains(&role.as_str()) {
                    problems.push(format!("plans.{}: unknown role '{}'", class, role));
                }
            }
            for problem in plan.ceiling_problems() {
                problems.push(format!("plans.{}: {}", class, problem));
            }
        }
        problems
    }
}

/// Per-class overrides from `[plans.<class>]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple: Option<PlanOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<PlanOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complex: Option<PlanOverride>,
}

impl PlanOverrides {
    fn for_class(&self, class: ComplexityClass) -> Option<&PlanOverride> {
        match class {
            ComplexityClass::Simple => self.simple.as_ref(),
            ComplexityClass::Medium => self.medium.as_ref(),
            ComplexityClass::Complex => self.complex.as_ref(),
        }
    }
}

/// Fields of one plan that may be overridden. Unset fields keep the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    /// An empty string clears the fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
}

impl PlanOverride {
    fn apply(&self, plan: &mut ExecutionPlan) {
        if let Some(ref workflow_type) = self.workflow_type {
            plan.workflow_type = workflow_type.clone();
        }
        if let Some(ref roles) = self.roles {
            plan.roles = roles.clone();
        }
        if let Some(ref fallback) = self.fallback_role {
            plan.fallback_role = Some(fallback.clone()).filter(|f| !f.is_empty());
        }
        if let Some(ref optional) = self.optional_roles {
            plan.optional_roles = optional.clone();
        }
        if let Some(max_messages) = self.max_messages {
            plan.max_messages = max_messages;
        }
        if let Some(max_cost) = self.max_cost {
            plan.max_cost = max_cost;
        }
        if let Some(max_tokens) = self.max_tokens {
            plan.max_tokens = max_tokens;
        }
        if let Some(max_duration_secs) = self.max_duration_secs {
            plan.max_duration_secs = max_duration_secs;
        }
    }
}
