use crate::error::StoreError;
use crate::queue::CommandId;
use crate::store::{now_iso8601, read_json_file, write_json_file};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// On-disk shape of the processed-set file.
#[derive(Debug, Serialize, Deserialize)]
struct ProcessedFile {
    processed_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<String>,
}

/// IDs of commands the dispatcher has already launched.
///
/// Owned by the dispatcher alone. Grows monotonically; nothing is evicted.
#[derive(Debug)]
pub struct ProcessedSet {
    path: PathBuf,
    ids: BTreeSet<String>,
}

impl ProcessedSet {
    /// Empty set that will persist to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ids: BTreeSet::new(),
        }
    }

    /// Read the persisted set. A missing file is an empty set.
    pub fn try_load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let ids = read_json_file::<ProcessedFile>(&path)?
            .map(|f| f.processed_ids.into_iter().collect())
            .unwrap_or_default();
        Ok(Self { path, ids })
    }

    /// Like [`try_load`](Self::try_load) but falls back to an empty set.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::try_load(path.clone()) {
            Ok(set) => set,
            Err(err) => {
                warn!(error = %err, "processed set unreadable, starting empty");
                Self::empty(path)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &CommandId) -> bool {
        self.ids.contains(id.as_str())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Record `id` and rewrite the whole file.
    ///
    /// The in-memory set keeps `id` even when the write fails, so a command
    /// is never launched twice by this process.
    pub fn mark_processed(&mut self, id: &CommandId) -> Result<(), StoreError> {
        self.ids.insert(id.as_str().to_string());
        self.persist()
    }

    fn persist(&self) -> Result<(), StoreError> {
        let file = ProcessedFile {
            processed_ids: self.ids.iter().cloned().collect(),
            last_updated: Some(now_iso8601()),
        };
        write_json_file(&self.path, &file)
    }
}
