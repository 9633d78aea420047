//! # Directory Source
//!
//! Reads every `*.yaml` / `*.yml` file below a root directory.

use super::{Snapshot, SnapshotSource, SourceError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load the directory synchronously
    pub fn load(&self) -> Result<Snapshot, SourceError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| SourceError::Io {
                path: self.root.display().to_string(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() || !is_yaml(entry.path()) {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            let content = std::fs::read_to_string(entry.path()).map_err(|e| SourceError::Io {
                path: entry.path().display().to_string(),
                source: e,
            })?;
            files.push((relative, content));
        }

        let snapshot = Snapshot::from_files(files)?;
        debug!(
            root = %self.root.display(),
            revision = %snapshot.revision(),
            documents = snapshot.documents().len(),
            "Loaded snapshot from directory"
        );
        Ok(snapshot)
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
}

#[async_trait]
impl SnapshotSource for DirectorySource {
    async fn current(&self) -> Result<Snapshot, SourceError> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.load())
            .await
            .map_err(|e| SourceError::Unavailable(format!("directory load task failed: {e}")))?
    }
}
