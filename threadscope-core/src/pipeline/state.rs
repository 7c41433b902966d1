//! Per-file processing state.

use crate::analysis::AnalysisRequest;
use crate::db::Batch;
use crate::ingest::ConversationIngestor;
use crate::sink::SinkEvent;
use crate::threading::ConversationThreader;
use crate::types::{ConversationFile, FileStatus};
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Where a file is in its processing cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePhase {
    #[default]
    Discovered,
    Reading,
    Parsing,
    Threading,
    Idle,
    Error,
    Removed,
}

impl FilePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilePhase::Discovered => "discovered",
            FilePhase::Reading => "reading",
            FilePhase::Parsing => "parsing",
            FilePhase::Threading => "threading",
            FilePhase::Idle => "idle",
            FilePhase::Error => "error",
            FilePhase::Removed => "removed",
        }
    }
}

/// Registry entry: the persisted file record plus its live phase.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedFile {
    #[serde(flatten)]
    pub file: ConversationFile,
    pub phase: FilePhase,
}

/// Shared, read-mostly view of every tracked file.
#[derive(Clone, Default)]
pub struct FileRegistry {
    files: Arc<DashMap<PathBuf, TrackedFile>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file: ConversationFile) {
        self.files.insert(
            file.path.clone(),
            TrackedFile {
                file,
                phase: FilePhase::Discovered,
            },
        );
    }

    pub fn get(&self, path: &Path) -> Option<TrackedFile> {
        self.files.get(path).map(|entry| entry.clone())
    }

    pub fn set_phase(&self, path: &Path, phase: FilePhase) {
        if let Some(mut entry) = self.files.get_mut(path) {
            entry.phase = phase;
            entry.file.status = match phase {
                FilePhase::Reading | FilePhase::Parsing | FilePhase::Threading => {
                    FileStatus::Processing
                }
                FilePhase::Error => FileStatus::Error,
                _ => FileStatus::Idle,
            };
        }
    }

    pub fn update(&self, path: &Path, f: impl FnOnce(&mut ConversationFile)) {
        if let Some(mut entry) = self.files.get_mut(path) {
            f(&mut entry.file);
        }
    }

    pub fn remove(&self, path: &Path) -> Option<TrackedFile> {
        self.files.remove(path).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All entries sorted by path.
    pub fn snapshot(&self) -> Vec<TrackedFile> {
        let mut files: Vec<TrackedFile> = self.files.iter().map(|e| e.value().clone()).collect();
        files.sort_by(|a, b| a.file.path.cmp(&b.file.path));
        files
    }
}

/// A processed batch that is not committed yet.
pub(crate) struct PendingBatch {
    pub batch: Batch,
    pub events: Vec<SinkEvent>,
    pub analysis: Vec<AnalysisRequest>,
}

/// Stateful per-file machinery, owned by at most one worker at a time.
pub(crate) struct FileSlot {
    pub ingestor: ConversationIngestor,
    pub threader: ConversationThreader,
    /// Last committed file record
    pub file: ConversationFile,
    pub pending: Option<PendingBatch>,
}

/// Coordinator-side bookkeeping for one file.
pub(crate) struct FileState {
    /// `None` while a worker holds the slot
    pub slot: Option<FileSlot>,
    /// Another change arrived while the file was active
    pub rerun: bool,
    /// Deleted while active; finalize once the slot returns
    pub remove_pending: bool,
    pub attempts: u32,
    pub retry_at: Option<Instant>,
}

impl FileState {
    pub fn new(slot: FileSlot) -> Self {
        Self {
            slot: Some(slot),
            rerun: false,
            remove_pending: false,
            attempts: 0,
            retry_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_phase_drives_status() {
        let registry = FileRegistry::new();
        let path = PathBuf::from("/r/proj/b.jsonl");
        registry.insert(ConversationFile::discovered(&path).unwrap());
        registry.insert(ConversationFile::discovered(Path::new("/r/proj/a.jsonl")).unwrap());

        registry.set_phase(&path, FilePhase::Parsing);
        assert_eq!(registry.get(&path).unwrap().file.status, FileStatus::Processing);
        registry.set_phase(&path, FilePhase::Error);
        assert_eq!(registry.get(&path).unwrap().file.status, FileStatus::Error);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].file.conversation_id, "a");
        assert_eq!(registry.len(), 2);

        registry.remove(&path);
        assert!(registry.get(&path).is_none());
    }

    #[test]
    fn test_tracked_file_serializes_flat() {
        let file = ConversationFile::discovered(Path::new("/r/proj/a.jsonl")).unwrap();
        let value = serde_json::to_value(TrackedFile {
            file,
            phase: FilePhase::Idle,
        })
        .unwrap();
        assert_eq!(value["projectId"], "proj");
        assert_eq!(value["phase"], "idle");
        assert_eq!(value["status"], "idle");
    }
}
