//! The history store interface the core reads.
//!
//! Persistence format is a collaborator's concern; the engine only needs to
//! find past runs by request id (deterministic retry) and to know when the
//! last successful run happened (skip-if-successful). An in-memory store is
//! provided for embedding and tests.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::scheduler::RunStatus;

/// One recorded run of a workflow file.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub request_id: String,
    pub file: PathBuf,
    /// The exact params string the run used, enabling deterministic retry.
    pub params: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub trait HistoryStore: Send + Sync {
    /// Find a run of `file` by its request id.
    fn find_by_request_id(&self, file: &Path, request_id: &str) -> Option<RunRecord>;

    /// The most recent successful run of `file`, if any.
    fn last_successful(&self, file: &Path) -> Option<RunRecord>;

    /// Record a finished run.
    fn append(&self, record: RunRecord);
}

/// A process-local history store.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: RwLock<Vec<RunRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn find_by_request_id(&self, file: &Path, request_id: &str) -> Option<RunRecord> {
        self.records
            .read()
            .iter()
            .rev()
            .find(|r| r.file == file && r.request_id == request_id)
            .cloned()
    }

    fn last_successful(&self, file: &Path) -> Option<RunRecord> {
        self.records
            .read()
            .iter()
            .rev()
            .find(|r| r.file == file && r.status == RunStatus::Success)
            .cloned()
    }

    fn append(&self, record: RunRecord) {
        self.records.write().push(record);
    }
}
