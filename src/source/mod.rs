//! # Manifest Snapshot Source
//!
//! Immutable, content-addressed snapshots of a declarative manifest tree.
//!
//! - `directory`: a source backed by a checked-out directory
//! - `poller`: publishes new revisions on a watch channel

mod directory;
mod poller;

pub use directory::DirectorySource;
pub use poller::SnapshotPoller;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// One parsed document of a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDocument {
    /// Path relative to the snapshot root, `/`-separated
    pub path: String,
    /// Position within a multi-document file
    pub index: usize,
    pub body: Value,
}

/// A read-only manifest tree at one revision
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    revision: String,
    documents: Vec<SnapshotDocument>,
}

impl Snapshot {
    /// Build a snapshot from `(relative path, yaml text)` pairs
    ///
    /// The revision is the SHA-256 of the sorted paths and their contents.
    pub fn from_files<P, C>(files: impl IntoIterator<Item = (P, C)>) -> Result<Self, SourceError>
    where
        P: AsRef<str>,
        C: AsRef<str>,
    {
        let mut files: Vec<(String, String)> = files
            .into_iter()
            .map(|(p, c)| (normalize_path(p.as_ref()), c.as_ref().to_string()))
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        let mut documents = Vec::new();
        for (path, content) in &files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(content.as_bytes());
            hasher.update([0u8]);
            documents.extend(parse_documents(path, content)?);
        }

        Ok(Self {
            revision: format!("sha256:{:x}", hasher.finalize()),
            documents,
        })
    }

    #[must_use]
    pub fn revision(&self) -> &str {
        &self.revision
    }

    #[must_use]
    pub fn documents(&self) -> &[SnapshotDocument] {
        &self.documents
    }

    /// Documents at or below `prefix`, in path order
    pub fn documents_under<'a>(
        &'a self,
        prefix: &str,
    ) -> impl Iterator<Item = &'a SnapshotDocument> + 'a {
        let prefix = normalize_path(prefix);
        self.documents.iter().filter(move |doc| {
            prefix.is_empty()
                || doc.path == prefix
                || doc
                    .path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn parse_documents(path: &str, content: &str) -> Result<Vec<SnapshotDocument>, SourceError> {
    use serde::Deserialize;

    let mut documents = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| SourceError::Parse {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        if value.is_null() {
            continue;
        }
        let body = serde_json::to_value(value).map_err(|e| SourceError::Parse {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        documents.push(SnapshotDocument {
            path: path.to_string(),
            index,
            body,
        });
    }
    Ok(documents)
}

/// Supplies the current snapshot of the manifest tree
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn current(&self) -> Result<Snapshot, SourceError>;
}
