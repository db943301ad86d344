//! Agent roles and the registry that resolves plan role ids to them.

use std::collections::HashMap;
use std::sync::Arc;

use steward_common::ExecutionPlan;

use crate::context::SectionKind;
use crate::errors::OrchestratorError;

/// Signal protocol appended to every role's instructions.
const SIGNAL_PROTOCOL: &str = "\
When you finish, end your reply with a one-paragraph <summary>...</summary> of what you did.
If you cannot make progress (missing information, contradictory requirements, a blocker \
outside your control), reply with <escalate>reason</escalate> instead of guessing.";

/// One agent role in a workflow.
pub trait AgentRole: Send + Sync {
    fn id(&self) -> &str;

    /// Role-specific system instructions.
    fn instructions(&self) -> String;

    /// How this role's output is fed to later steps. Code-producing roles
    /// are excerpted before they are dropped.
    fn output_kind(&self) -> SectionKind {
        SectionKind::History
    }

    /// Output-token cap for this role's calls.
    fn max_output_tokens(&self, default: u64) -> u64 {
        default
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinRole {
    Planner,
    Implementer,
    Reviewer,
    Tester,
}

impl BuiltinRole {
    pub const ALL: [BuiltinRole; 4] = [
        BuiltinRole::Planner,
        BuiltinRole::Implementer,
        BuiltinRole::Reviewer,
        BuiltinRole::Tester,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinRole::Planner => "planner",
            BuiltinRole::Implementer => "implementer",
            BuiltinRole::Reviewer => "reviewer",
            BuiltinRole::Tester => "tester",
        }
    }

    fn brief(&self) -> &'static str {
        match self {
            BuiltinRole::Planner => {
                "You are the planner. Break the work item into concrete, ordered changes. \
                 Name the files to touch and the acceptance criterion each change serves. \
                 Do not write code."
            }
            BuiltinRole::Implementer => {
                "You are the implementer. Make the code changes the work item needs, \
                 following the plan from earlier steps if there is one. Show every change \
                 as a unified diff."
            }
            BuiltinRole::Reviewer => {
                "You are the reviewer. Check the changes from earlier steps against every \
                 acceptance criterion. List concrete defects with file and line, or state \
                 that the change is acceptable."
            }
            BuiltinRole::Tester => {
                "You are the tester. Write or update tests that prove each acceptance \
                 criterion, and report which criteria are covered."
            }
        }
    }
}

impl AgentRole for BuiltinRole {
    fn id(&self) -> &str {
        self.as_str()
    }

    fn instructions(&self) -> String {
        format!("{}\n\n{}", self.brief(), SIGNAL_PROTOCOL)
    }

    fn output_kind(&self) -> SectionKind {
        match self {
            BuiltinRole::Implementer | BuiltinRole::Tester => SectionKind::CodeExcerpt,
            BuiltinRole::Planner | BuiltinRole::Reviewer => SectionKind::History,
        }
    }

    fn max_output_tokens(&self, default: u64) -> u64 {
        match self {
            // Plans and reviews are prose; they never need the full cap.
            BuiltinRole::Planner | BuiltinRole::Reviewer => default.min(4_096),
            BuiltinRole::Implementer | BuiltinRole::Tester => default,
        }
    }
}

/// Role ids to implementations. Resolved once per step.
#[derive(Clone, Default)]
pub struct RoleRegistry {
    roles: HashMap<String, Arc<dyn AgentRole>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four built-in roles.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for role in BuiltinRole::ALL {
            registry.register(Arc::new(role));
        }
        registry
    }

    /// Add or replace a role under its own id.
    pub fn register(&mut self, role: Arc<dyn AgentRole>) {
        self.roles.insert(role.id().to_string(), role);
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn AgentRole>, OrchestratorError> {
        self.roles
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownRole(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.roles.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.roles.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Every role the plan can dispatch to must be registered.
    pub fn check_plan(&self, plan: &ExecutionPlan) -> Result<(), OrchestratorError> {
        plan.roles
            .iter()
            .chain(plan.fallback_role.iter())
            .find(|id| !self.contains(id))
            .map_or(Ok(()), |id| Err(OrchestratorError::UnknownRole(id.clone())))
    }
}
