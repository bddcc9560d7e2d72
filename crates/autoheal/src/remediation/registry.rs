//! Run registry.
//!
//! Owns the canonical [`RunState`] of every run started by this process.
//! Each run lives in its own slot with its own lock, so mutations are
//! serialized per run while unrelated runs proceed in parallel. The outer
//! map is only write-locked to insert a new slot.

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::{FinalResults, RunId, RunRequest, RunState, RunStatus};
use crate::error::RegistryError;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// CI passed, or the tests were already green
    Completed(String),
    /// Iteration budget used up without a passing CI run
    Exhausted(String),
    /// Unrecoverable error
    Fatal(String),
    /// Stopped by an operator
    Cancelled,
}

impl Termination {
    fn status(&self) -> RunStatus {
        match self {
            Self::Completed(_) => RunStatus::Completed,
            Self::Exhausted(_) | Self::Fatal(_) | Self::Cancelled => RunStatus::Failed,
        }
    }
}

#[derive(Debug)]
struct RunEntry {
    state: RunState,
    results: Option<FinalResults>,
}

type Slot = Arc<RwLock<RunEntry>>;

/// In-memory registry of runs. Created at process start, never persisted.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RunId, Slot>>,
}

impl RunRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a queued run. The run is visible to `get` before this returns.
    pub async fn create(&self, request: &RunRequest, max_iterations: u32) -> RunId {
        let run_id = RunId::new();
        let entry = RunEntry {
            state: RunState::new(run_id, request, max_iterations),
            results: None,
        };
        self.runs
            .write()
            .await
            .insert(run_id, Arc::new(RwLock::new(entry)));

        info!(%run_id, repo = %request.repo_url, max_iterations, "Registered run");
        run_id
    }

    async fn slot(&self, run_id: RunId) -> Result<Slot, RegistryError> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(RegistryError::NotFound(run_id))
    }

    /// Snapshot of the run's current state.
    pub async fn get(&self, run_id: RunId) -> Result<RunState, RegistryError> {
        let slot = self.slot(run_id).await?;
        let entry = slot.read().await;
        Ok(entry.state.clone())
    }

    /// Atomic read-modify-write of one run's state.
    ///
    /// `apply` runs against a copy; the copy replaces the stored state only
    /// if `apply` succeeds, so readers never see a half-applied change.
    pub async fn mutate<F, R>(&self, run_id: RunId, apply: F) -> Result<R, RegistryError>
    where
        F: FnOnce(&mut RunState) -> Result<R, RegistryError>,
    {
        let slot = self.slot(run_id).await?;
        let mut entry = slot.write().await;
        if entry.state.status.is_terminal() {
            return Err(RegistryError::InvalidTransition {
                run_id,
                from: entry.state.status,
                to: entry.state.status,
            });
        }

        let mut next = entry.state.clone();
        let out = apply(&mut next)?;
        next.updated_at = Utc::now();
        entry.state = next;
        Ok(out)
    }

    /// Move a run to its terminal status and store its results in one write.
    ///
    /// `build` sees the terminal state, so the results it produces agree with
    /// what `get` will return from now on.
    pub async fn finalize<F>(
        &self,
        run_id: RunId,
        termination: &Termination,
        build: F,
    ) -> Result<(), RegistryError>
    where
        F: FnOnce(&RunState) -> FinalResults,
    {
        let slot = self.slot(run_id).await?;
        let mut entry = slot.write().await;

        let mut next = entry.state.clone();
        next.transition(termination.status())?;
        match termination {
            Termination::Completed(message) | Termination::Exhausted(message) => {
                next.latest_message.clone_from(message);
            }
            Termination::Fatal(message) => {
                next.latest_message.clone_from(message);
                next.error = Some(message.clone());
            }
            Termination::Cancelled => {
                next.latest_message = "cancelled".to_string();
                next.error = Some("cancelled".to_string());
            }
        }
        next.updated_at = Utc::now();

        let results = build(&next);
        debug!(%run_id, status = %next.status, "Finalized run");
        entry.state = next;
        entry.results = Some(results);
        Ok(())
    }

    /// Final results, `None` while the run is still in flight.
    pub async fn results(&self, run_id: RunId) -> Result<Option<FinalResults>, RegistryError> {
        let slot = self.slot(run_id).await?;
        let entry = slot.read().await;
        Ok(entry.results.clone())
    }

    /// All runs, newest first.
    pub async fn list(&self) -> Vec<RunState> {
        let slots: Vec<Slot> = self.runs.read().await.values().cloned().collect();
        let mut states =
            join_all(slots.iter().map(|slot| async move { slot.read().await.state.clone() }))
                .await;
        states.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        states
    }
}
