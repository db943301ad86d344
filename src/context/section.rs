//! Prompt sections.

use serde::{Deserialize, Serialize};

/// What a section holds, which decides how it may be shrunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    /// Role instructions. Never shrunk.
    System,
    /// The work item itself. Never shrunk.
    Task,
    /// Rolling summary of prior steps.
    Summary,
    /// Earlier step output, oldest first.
    History,
    /// Code or artifact excerpt from an earlier step.
    CodeExcerpt,
}

impl SectionKind {
    pub fn is_protected(&self) -> bool {
        matches!(self, SectionKind::System | SectionKind::Task)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub kind: SectionKind,
    pub title: String,
    pub content: String,
}

impl Section {
    pub fn new(
        kind: SectionKind,
        id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(SectionKind::System, "system", "Instructions", content)
    }

    pub fn task(content: impl Into<String>) -> Self {
        Self::new(SectionKind::Task, "task", "Work item", content)
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Self::new(SectionKind::Summary, "summary", "Progress so far", content)
    }

    pub fn history(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(SectionKind::History, id, title, content)
    }

    pub fn excerpt(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(SectionKind::CodeExcerpt, id, title, content)
    }

    pub fn render(&self) -> String {
        format!("## {}\n{}", self.title, self.content)
    }
}

/// Join sections into the final prompt text, skipping empty ones.
pub fn assemble(sections: &[Section]) -> String {
    sections
        .iter()
        .filter(|s| !s.content.trim().is_empty())
        .map(Section::render)
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_kinds() {
        assert!(SectionKind::System.is_protected());
        assert!(SectionKind::Task.is_protected());
        assert!(!SectionKind::History.is_protected());
        assert!(!SectionKind::CodeExcerpt.is_protected());
    }

    #[test]
    fn assemble_skips_empty_sections() {
        let prompt = assemble(&[
            Section::system("Be terse."),
            Section::summary(""),
            Section::task("Fix the bug."),
        ]);
        assert_eq!(prompt, "## Instructions\nBe terse.\n\n## Work item\nFix the bug.");
    }
}
