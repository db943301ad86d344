//! Work-item sources.
//!
//! A run starts from a [`WorkItem`] fetched by id. The file-backed source
//! reads `.steward/items/<id>.{yaml,yml,json,md}`; Markdown items look like:
//!
//! ```markdown
//! # Fix login redirect
//!
//! Users land on /home instead of the page they asked for.
//!
//! - [ ] redirect honours the `next` parameter
//! - [x] unknown targets fall back to /home
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use steward_common::WorkItem;

use crate::errors::SourceError;

#[async_trait]
pub trait WorkItemSource: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<WorkItem, SourceError>;
}

const EXTENSIONS: [&str; 4] = ["yaml", "yml", "json", "md"];

/// Reads work items from a directory of files named after the item id.
pub struct FileWorkItemSource {
    dir: PathBuf,
}

impl FileWorkItemSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn locate(&self, id: &str) -> Result<PathBuf, SourceError> {
        // Ids become file names; refuse anything that could leave the directory.
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(SourceError::NotFound { id: id.to_string() });
        }
        EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{}.{}", id, ext)))
            .find(|p| p.is_file())
            .ok_or_else(|| SourceError::NotFound { id: id.to_string() })
    }

    /// Ids of every item in the directory, sorted.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.contains(&e))
            })
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[async_trait]
impl WorkItemSource for FileWorkItemSource {
    async fn fetch(&self, id: &str) -> Result<WorkItem, SourceError> {
        let path = self.locate(id)?;
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                SourceError::Auth(format!("{}: {}", path.display(), e))
            } else {
                SourceError::Malformed {
                    id: id.to_string(),
                    message: e.to_string(),
                }
            }
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let item = parse_item(id, ext, &content)?;
        tracing::debug!(
            item = %item.id,
            criteria = item.criteria_count(),
            path = %path.display(),
            "Fetched work item"
        );
        Ok(item)
    }
}

fn parse_item(id: &str, ext: &str, content: &str) -> Result<WorkItem, SourceError> {
    let malformed = |message: String| SourceError::Malformed {
        id: id.to_string(),
        message,
    };
    let mut item = match ext {
        "json" => serde_json::from_str::<WorkItem>(content).map_err(|e| malformed(e.to_string()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str::<WorkItem>(content).map_err(|e| malformed(e.to_string()))?
        }
        _ => parse_markdown(id, content),
    };
    if item.id.is_empty() {
        item.id = id.to_string();
    }
    if item.title.trim().is_empty() {
        return Err(malformed("missing title".to_string()));
    }
    Ok(item)
}

/// First `#` heading is the title, checkbox lines are criteria, the rest is
/// the description.
fn parse_markdown(id: &str, content: &str) -> WorkItem {
    let mut title = None;
    let mut criteria = Vec::new();
    let mut description = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim_start();
        if title.is_none()
            && let Some(heading) = trimmed.strip_prefix("# ")
        {
            title = Some(heading.trim().to_string());
            continue;
        }
        if let Some(criterion) = checkbox_text(trimmed) {
            if !criterion.is_empty() {
                criteria.push(criterion.to_string());
            }
            continue;
        }
        description.push(line);
    }

    WorkItem::new(id, title.unwrap_or_default())
        .with_description(description.join("\n").trim())
        .with_criteria(criteria)
}

fn checkbox_text(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("- ").or_else(|| line.strip_prefix("* "))?;
    ["[ ]", "[x]", "[X]"]
        .iter()
        .find_map(|mark| rest.strip_prefix(mark))
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_markdown_item() {
        let md = "# Fix login redirect\n\nUsers land on /home.\n\n- [ ] honours next\n- [x] falls back\n* [ ] logs the miss\n- plain bullet\n";
        let item = parse_markdown("ENG-4", md);
        assert_eq!(item.id, "ENG-4");
        assert_eq!(item.title, "Fix login redirect");
        assert_eq!(
            item.acceptance_criteria,
            vec!["honours next", "falls back", "logs the miss"]
        );
        assert!(item.description.contains("Users land on /home."));
        assert!(item.description.contains("- plain bullet"));
    }

    #[test]
    fn test_markdown_without_heading_is_malformed() {
        let err = parse_item("ENG-5", "md", "- [ ] something\n").unwrap_err();
        assert!(matches!(err, SourceError::Malformed { .. }));
    }

    #[test]
    fn test_yaml_item_defaults_id() {
        let yaml = "id: ''\ntitle: Add retries\nacceptance_criteria:\n  - retries once\n";
        let item = parse_item("ENG-6", "yaml", yaml).unwrap();
        assert_eq!(item.id, "ENG-6");
        assert_eq!(item.criteria_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_json_and_missing() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("ENG-7.json"),
            r#"{"id":"ENG-7","title":"Cache tokens","acceptance_criteria":["a","b","c"]}"#,
        )
        .unwrap();
        let source = FileWorkItemSource::new(dir.path());

        let item = source.fetch("ENG-7").await.unwrap();
        assert_eq!(item.criteria_count(), 3);

        let err = source.fetch("ENG-8").await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound { ref id } if id == "ENG-8"));

        let err = source.fetch("../ENG-7").await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_fetch_malformed_json() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let err = FileWorkItemSource::new(dir.path())
            .fetch("bad")
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Malformed { .. }));
    }

    #[test]
    fn test_list_ids() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.md"), "# B").unwrap();
        std::fs::write(dir.path().join("a.yaml"), "title: A").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let ids = FileWorkItemSource::new(dir.path()).list();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
