//! Append-only event log per run.
//!
//! Every run accumulates four record lists: classified failures, fix
//! attempts, CI checks, and repository operations. Records are only ever
//! appended; the single permitted mutation is promoting a fix from
//! `applied` to `verified`. Readers get owned snapshots, never a view into
//! a list that is being written.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::types::{
    CiTimelineEntry, FailureRecord, FixRecord, FixStatus, GitOperation, RunId,
};
use crate::error::RegistryError;

/// Records accumulated by one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunLog {
    pub failures: Vec<FailureRecord>,
    pub fixes: Vec<FixRecord>,
    pub ci_timeline: Vec<CiTimelineEntry>,
    pub git_operations: Vec<GitOperation>,
}

impl RunLog {
    /// Most recent CI check.
    #[must_use]
    pub fn latest_ci(&self) -> Option<&CiTimelineEntry> {
        self.ci_timeline.last()
    }
}

/// Process-lifetime store of run logs, keyed by run.
#[derive(Debug, Default)]
pub struct RunMemory {
    logs: RwLock<HashMap<RunId, Arc<RwLock<RunLog>>>>,
}

impl RunMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty log for `run_id`. Idempotent.
    pub async fn open(&self, run_id: RunId) {
        let mut logs = self.logs.write().await;
        logs.entry(run_id).or_default();
    }

    async fn log(&self, run_id: RunId) -> Result<Arc<RwLock<RunLog>>, RegistryError> {
        let logs = self.logs.read().await;
        logs.get(&run_id)
            .cloned()
            .ok_or(RegistryError::NotFound(run_id))
    }

    pub async fn append_failure(
        &self,
        run_id: RunId,
        record: FailureRecord,
    ) -> Result<(), RegistryError> {
        let log = self.log(run_id).await?;
        log.write().await.failures.push(record);
        Ok(())
    }

    pub async fn append_fix(&self, run_id: RunId, record: FixRecord) -> Result<(), RegistryError> {
        let log = self.log(run_id).await?;
        log.write().await.fixes.push(record);
        Ok(())
    }

    pub async fn append_ci(
        &self,
        run_id: RunId,
        entry: CiTimelineEntry,
    ) -> Result<(), RegistryError> {
        let log = self.log(run_id).await?;
        log.write().await.ci_timeline.push(entry);
        Ok(())
    }

    pub async fn append_git_op(
        &self,
        run_id: RunId,
        operation: GitOperation,
    ) -> Result<(), RegistryError> {
        let log = self.log(run_id).await?;
        log.write().await.git_operations.push(operation);
        Ok(())
    }

    /// Promote every `applied` fix from `iteration` to `verified`.
    ///
    /// Returns how many records changed. `failed` and already-verified
    /// records are left alone.
    pub async fn mark_verified(&self, run_id: RunId, iteration: u32) -> Result<usize, RegistryError> {
        let log = self.log(run_id).await?;
        let mut log = log.write().await;
        let mut promoted = 0;
        for fix in log
            .fixes
            .iter_mut()
            .filter(|f| f.iteration == iteration && f.status == FixStatus::Applied)
        {
            fix.status = FixStatus::Verified;
            promoted += 1;
        }
        debug!(%run_id, iteration, promoted, "Verified applied fixes");
        Ok(promoted)
    }

    /// Owned copy of every record for `run_id`.
    pub async fn snapshot(&self, run_id: RunId) -> Result<RunLog, RegistryError> {
        let log = self.log(run_id).await?;
        let snapshot = log.read().await.clone();
        Ok(snapshot)
    }
}
