//! Artifact sinks: where accepted step output goes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Output of one completed step, offered to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub run_id: i64,
    pub step_seq: u32,
    pub role: String,
    pub work_item_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkReceipt {
    /// Where the artifact ended up (path, URL, ...).
    pub location: String,
}

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn submit(&self, artifact: &Artifact) -> Result<SinkReceipt>;
}

/// Writes each artifact to `<root>/run-<id>/<seq>-<role>.md`.
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, artifact: &Artifact) -> PathBuf {
        self.root
            .join(format!("run-{}", artifact.run_id))
            .join(format!("{:02}-{}.md", artifact.step_seq, artifact.role))
    }
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn submit(&self, artifact: &Artifact) -> Result<SinkReceipt> {
        let path = self.path_for(artifact);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let body = format!(
            "<!-- run {} / step {} / {} / {} -->\n\n{}\n",
            artifact.run_id,
            artifact.step_seq,
            artifact.role,
            artifact.work_item_id,
            artifact.content.trim_end()
        );
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write artifact {}", path.display()))?;
        Ok(SinkReceipt {
            location: path.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn artifact() -> Artifact {
        Artifact {
            run_id: 3,
            step_seq: 2,
            role: "implementer".into(),
            work_item_id: "ENG-1".into(),
            content: "patched the handler".into(),
        }
    }

    #[tokio::test]
    async fn test_directory_sink_writes_file() {
        let dir = tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        let receipt = sink.submit(&artifact()).await.unwrap();
        assert!(receipt.location.ends_with("02-implementer.md"));
        let written = std::fs::read_to_string(dir.path().join("run-3/02-implementer.md")).unwrap();
        assert!(written.contains("patched the handler"));
        assert!(written.contains("ENG-1"));
    }

    #[tokio::test]
    async fn test_directory_sink_reports_write_failure() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("root-file");
        std::fs::write(&blocker, "not a directory").unwrap();
        let sink = DirectorySink::new(&blocker);
        assert!(sink.submit(&artifact()).await.is_err());
    }
}
