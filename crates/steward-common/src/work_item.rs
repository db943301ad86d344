use serde::{Deserialize, Deserializer, Serialize};

/// A unit of requested work fetched from the issue tracker.
///
/// Immutable once fetched. The orchestrator borrows it for the lifetime of a
/// run and persists a snapshot alongside the run record for resumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Ordered acceptance criteria. A missing or `null` list is read as empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub acceptance_criteria: Vec<String>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn criteria_count(&self) -> usize {
        self.acceptance_criteria.len()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}
