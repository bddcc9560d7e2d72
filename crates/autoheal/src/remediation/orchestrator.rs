//! Run orchestration.
//!
//! The [`Orchestrator`] is the surface callers use: it validates a request,
//! registers the run, and spawns one task per run that forks the repository
//! when it cannot push there, clones it, creates the remediation branch, drives the
//! [`IterationStateMachine`], optionally opens a pull request, and stores
//! the final results. Observers query state concurrently through the same
//! handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::machine::{Capabilities, IterationStateMachine, LoopExit, LoopSettings};
use super::memory::{RunLog, RunMemory};
use super::registry::{RunRegistry, Termination};
use super::results;
use super::score::{ScoreCalculator, ScoreConfig};
use super::types::{
    FinalResults, GitOpStatus, GitOperation, GitStage, RunId, RunRequest, RunState, RunStatus,
};
use crate::capabilities::{ForkRef, PullRequestDraft, WorkingTree};
use crate::error::{RegistryError, StartError};

/// Orchestrator-wide settings.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Iteration budget used when a request does not name one, and the
    /// largest budget a request may ask for
    pub max_iterations: u32,
    /// Open a pull request when a run applied at least one fix
    pub open_pull_request: bool,
    pub loop_settings: LoopSettings,
    pub score: ScoreConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            open_pull_request: true,
            loop_settings: LoopSettings::default(),
            score: ScoreConfig::default(),
        }
    }
}

/// Answer to a results query.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResults {
    Ready(Box<FinalResults>),
    /// The run has not reached a terminal status yet
    Pending,
}

/// Remediation branch for a team and leader.
///
/// Uppercased, with spaces and hyphens turned into underscores and any
/// other punctuation dropped, e.g. `Code Warriors` / `John Doe` becomes
/// `CODE_WARRIORS_JOHN_DOE_AI_Fix`.
#[must_use]
pub fn branch_name(team: &str, leader: &str) -> String {
    fn normalize(part: &str) -> String {
        let mapped: String = part
            .trim()
            .to_uppercase()
            .chars()
            .filter_map(|c| match c {
                ' ' | '-' | '_' => Some('_'),
                c if c.is_ascii_alphanumeric() => Some(c),
                _ => None,
            })
            .collect();
        let mut collapsed = String::with_capacity(mapped.len());
        for c in mapped.chars() {
            if c == '_' && collapsed.ends_with('_') {
                continue;
            }
            collapsed.push(c);
        }
        collapsed.trim_matches('_').to_string()
    }

    let parts: Vec<String> = [normalize(team), normalize(leader)]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        "AI_Fix".to_string()
    } else {
        format!("{}_AI_Fix", parts.join("_"))
    }
}

/// Entry point for starting and observing runs.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<RunRegistry>,
    memory: Arc<RunMemory>,
    caps: Capabilities,
    settings: Arc<OrchestratorSettings>,
    cancellations: Arc<RwLock<HashMap<RunId, CancellationToken>>>,
}

impl Orchestrator {
    pub fn new(caps: Capabilities, settings: OrchestratorSettings) -> Self {
        Self {
            registry: Arc::new(RunRegistry::new()),
            memory: Arc::new(RunMemory::new()),
            caps,
            settings: Arc::new(settings),
            cancellations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validate `request`, register a queued run, and schedule it.
    ///
    /// Returns as soon as the run is registered; no stage has executed yet.
    pub async fn start(&self, request: RunRequest) -> Result<RunId, StartError> {
        let max_iterations = self.validate(&request)?;

        let run_id = self.registry.create(&request, max_iterations).await;
        self.memory.open(run_id).await;

        let cancel = CancellationToken::new();
        self.cancellations
            .write()
            .await
            .insert(run_id, cancel.clone());

        let task = RunTask {
            run_id,
            request,
            registry: Arc::clone(&self.registry),
            memory: Arc::clone(&self.memory),
            caps: self.caps.clone(),
            settings: Arc::clone(&self.settings),
            cancel,
        };
        let cancellations = Arc::clone(&self.cancellations);
        tokio::spawn(async move {
            let handle = tokio::spawn(task.clone().execute());
            if let Err(join_error) = handle.await {
                let reason = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    "task aborted".to_string()
                };
                error!(%run_id, %reason, "Run task crashed");
                task.finish(
                    Termination::Fatal(format!("Unhandled error: {reason}")),
                    None,
                )
                .await;
            }
            cancellations.write().await.remove(&run_id);
        });

        info!(%run_id, "Run scheduled");
        Ok(run_id)
    }

    fn validate(&self, request: &RunRequest) -> Result<u32, StartError> {
        for (field, value) in [
            ("repo_url", &request.repo_url),
            ("team_name", &request.team_name),
            ("leader_name", &request.leader_name),
        ] {
            if value.trim().is_empty() {
                return Err(StartError::EmptyField(field));
            }
        }

        let ceiling = self.settings.max_iterations;
        let requested = request.max_iterations.unwrap_or(ceiling);
        if requested == 0 || requested > ceiling {
            return Err(StartError::InvalidMaxIterations { requested, ceiling });
        }
        Ok(requested)
    }

    /// Current state of a run.
    pub async fn status(&self, run_id: RunId) -> Result<RunState, RegistryError> {
        self.registry.get(run_id).await
    }

    /// Final results of a terminal run, `Pending` otherwise.
    pub async fn results(&self, run_id: RunId) -> Result<RunResults, RegistryError> {
        Ok(match self.registry.results(run_id).await? {
            Some(results) => RunResults::Ready(Box::new(results)),
            None => RunResults::Pending,
        })
    }

    /// Records accumulated so far.
    pub async fn memory(&self, run_id: RunId) -> Result<RunLog, RegistryError> {
        self.memory.snapshot(run_id).await
    }

    /// All runs, newest first.
    pub async fn list(&self) -> Vec<RunState> {
        self.registry.list().await
    }

    /// Ask a run to stop at its next suspension point.
    ///
    /// Returns `false` when the run already finished.
    pub async fn cancel(&self, run_id: RunId) -> Result<bool, RegistryError> {
        let state = self.registry.get(run_id).await?;
        if state.status.is_terminal() {
            return Ok(false);
        }
        match self.cancellations.read().await.get(&run_id) {
            Some(token) => {
                info!(%run_id, "Cancelling run");
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Poll until the run is terminal and return its results.
    pub async fn wait_for(
        &self,
        run_id: RunId,
        poll: Duration,
    ) -> Result<FinalResults, RegistryError> {
        loop {
            if let RunResults::Ready(results) = self.results(run_id).await? {
                return Ok(*results);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Everything one run task needs, detached from the orchestrator handle.
#[derive(Clone)]
struct RunTask {
    run_id: RunId,
    request: RunRequest,
    registry: Arc<RunRegistry>,
    memory: Arc<RunMemory>,
    caps: Capabilities,
    settings: Arc<OrchestratorSettings>,
    cancel: CancellationToken,
}

impl RunTask {
    async fn execute(self) {
        let run_id = self.run_id;
        if let Err(e) = self
            .registry
            .mutate(run_id, |s| {
                s.transition(RunStatus::Running)?;
                s.latest_message = "Starting remediation".to_string();
                Ok(())
            })
            .await
        {
            warn!(%run_id, error = %e, "Run could not start");
            return;
        }

        let branch = branch_name(&self.request.team_name, &self.request.leader_name);
        let (tree, fork) = match self.setup(&branch).await {
            Ok(setup) => setup,
            Err(termination) => {
                self.finish(termination, None).await;
                return;
            }
        };

        let state = match self.registry.get(run_id).await {
            Ok(state) => state,
            Err(e) => {
                error!(%run_id, error = %e, "Run vanished from registry");
                return;
            }
        };
        let exit = IterationStateMachine::new(
            run_id,
            state.max_iterations,
            Arc::clone(&self.registry),
            Arc::clone(&self.memory),
            self.caps.clone(),
            self.settings.loop_settings.clone(),
            tree.clone(),
            branch.clone(),
            self.cancel.clone(),
        )
        .run()
        .await;

        let pull_request_url = match exit {
            LoopExit::Remediated | LoopExit::Exhausted => {
                let fork_owner = fork.as_ref().map(|f| f.owner.as_str());
                self.open_pull_request(&tree, &branch, fork_owner).await
            }
            LoopExit::Fatal(_) | LoopExit::Cancelled => None,
        };

        let termination = match exit {
            LoopExit::Remediated => Termination::Completed("Remediation complete".to_string()),
            LoopExit::Exhausted => Termination::Exhausted(format!(
                "Max iterations ({}) reached without a passing CI run",
                state.max_iterations
            )),
            LoopExit::Fatal(message) => Termination::Fatal(message),
            LoopExit::Cancelled => Termination::Cancelled,
        };
        self.finish(termination, pull_request_url).await;

        if let Err(e) = self.caps.repository.discard(&tree).await {
            warn!(%run_id, error = %e, "Failed to clean up working tree");
        }
    }

    async fn record_git(&self, stage: GitStage, status: GitOpStatus, message: impl Into<String>) {
        if let Err(e) = self
            .memory
            .append_git_op(self.run_id, GitOperation::new(stage, status, message))
            .await
        {
            warn!(run_id = %self.run_id, error = %e, "Failed to record git operation");
        }
    }

    /// Fork the target when we cannot push to it.
    ///
    /// Any failure here falls back to the original repository with a
    /// warning; pushing may still fail later.
    async fn fork_if_needed(&self) -> Result<Option<ForkRef>, Termination> {
        let repo_url = &self.request.repo_url;
        let access = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Termination::Cancelled),
            result = self.caps.repository.can_push(repo_url) => result,
        };
        match access {
            Ok(true) => return Ok(None),
            Ok(false) => {}
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Could not check push access");
                self.record_git(
                    GitStage::Fork,
                    GitOpStatus::Warning,
                    format!("Could not check push access, using {repo_url}: {e}"),
                )
                .await;
                return Ok(None);
            }
        }

        self.record_git(
            GitStage::Fork,
            GitOpStatus::Started,
            format!("No push access to {repo_url}, forking"),
        )
        .await;
        let forked = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Termination::Cancelled),
            result = self.caps.repository.fork(repo_url) => result,
        };
        match forked {
            Ok(fork) => {
                self.record_git(
                    GitStage::Fork,
                    GitOpStatus::Success,
                    format!("Forked to {}", fork.repo_url),
                )
                .await;
                if !fork.ready {
                    self.record_git(
                        GitStage::Fork,
                        GitOpStatus::Warning,
                        format!("Fork {} not ready yet, continuing", fork.repo_url),
                    )
                    .await;
                }
                info!(run_id = %self.run_id, fork = %fork.repo_url, "Working on fork");
                Ok(Some(fork))
            }
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Fork failed, using original repository");
                self.record_git(
                    GitStage::Fork,
                    GitOpStatus::Warning,
                    format!("Fork failed, using {repo_url}: {e}"),
                )
                .await;
                Ok(None)
            }
        }
    }

    /// Clone the repository (or its fork) and create the remediation branch.
    async fn setup(&self, branch: &str) -> Result<(WorkingTree, Option<ForkRef>), Termination> {
        let fork = self.fork_if_needed().await?;
        let repo_url = fork
            .as_ref()
            .map_or(self.request.repo_url.as_str(), |f| f.repo_url.as_str());
        self.record_git(GitStage::Clone, GitOpStatus::Started, format!("Cloning {repo_url}"))
            .await;

        let cloned = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Termination::Cancelled),
            result = self.caps.repository.clone_repo(repo_url) => result,
        };
        let tree = match cloned {
            Ok(tree) => tree,
            Err(e) => {
                self.record_git(GitStage::Clone, GitOpStatus::Error, e.to_string())
                    .await;
                return Err(Termination::Fatal(format!("Clone failed: {e}")));
            }
        };
        self.record_git(GitStage::Clone, GitOpStatus::Success, "Repository cloned")
            .await;

        let owned_branch = branch.to_string();
        if let Err(e) = self
            .registry
            .mutate(self.run_id, |s| {
                s.branch = owned_branch;
                s.latest_message = "Creating remediation branch".to_string();
                Ok(())
            })
            .await
        {
            warn!(run_id = %self.run_id, error = %e, "Failed to record branch");
        }
        self.record_git(
            GitStage::Branch,
            GitOpStatus::Started,
            format!("Creating branch {branch}"),
        )
        .await;

        let created = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(None),
            result = self.caps.repository.create_branch(&tree, branch) => result.map_err(Some),
        };
        match created {
            Ok(()) => {
                self.record_git(
                    GitStage::Branch,
                    GitOpStatus::Success,
                    format!("Created branch {branch}"),
                )
                .await;
                Ok((tree, fork))
            }
            Err(error) => {
                let termination = match error {
                    Some(e) => {
                        self.record_git(GitStage::Branch, GitOpStatus::Error, e.to_string())
                            .await;
                        Termination::Fatal(format!("Branch creation failed: {e}"))
                    }
                    None => Termination::Cancelled,
                };
                if let Err(e) = self.caps.repository.discard(&tree).await {
                    warn!(run_id = %self.run_id, error = %e, "Failed to clean up working tree");
                }
                Err(termination)
            }
        }
    }

    /// Best-effort pull request against the requested repository; failure is
    /// recorded as a warning only. Fixes pushed to a fork are offered as
    /// `fork_owner:branch`.
    async fn open_pull_request(
        &self,
        tree: &WorkingTree,
        branch: &str,
        fork_owner: Option<&str>,
    ) -> Option<String> {
        if !self.settings.open_pull_request {
            return None;
        }
        let state = self.registry.get(self.run_id).await.ok()?;
        if state.total_fixes_applied == 0 {
            return None;
        }

        let prefix = &self.settings.loop_settings.commit_prefix;
        let head = match fork_owner {
            Some(owner) => format!("{owner}:{branch}"),
            None => branch.to_string(),
        };
        let draft = PullRequestDraft {
            repo_url: self.request.repo_url.clone(),
            title: format!(
                "{prefix} {} automated fix(es) - {}",
                state.total_fixes_applied, state.team_name
            ),
            body: format!(
                "## Automated remediation\n\n\
                 - **Team:** {}\n\
                 - **Leader:** {}\n\
                 - **Branch:** `{branch}`\n\
                 - **Failures detected:** {}\n\
                 - **Fixes applied:** {}\n\
                 - **Iterations:** {}/{}\n",
                state.team_name,
                state.leader_name,
                state.total_failures_detected,
                state.total_fixes_applied,
                state.current_iteration,
                state.max_iterations,
            ),
            head,
            base: tree.base_branch.clone(),
        };

        self.record_git(
            GitStage::PullRequest,
            GitOpStatus::Started,
            format!("Opening pull request from {} into {}", draft.head, draft.base),
        )
        .await;
        match self.caps.repository.open_pull_request(tree, &draft).await {
            Ok(url) => {
                self.record_git(
                    GitStage::PullRequest,
                    GitOpStatus::Success,
                    format!("Opened pull request {url}"),
                )
                .await;
                Some(url)
            }
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Pull request not opened");
                self.record_git(
                    GitStage::PullRequest,
                    GitOpStatus::Warning,
                    format!("Pull request not opened: {e}"),
                )
                .await;
                None
            }
        }
    }

    /// Store the terminal status and results.
    async fn finish(&self, termination: Termination, pull_request_url: Option<String>) {
        let log = match self.memory.snapshot(self.run_id).await {
            Ok(log) => log,
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Run log missing, reporting empty history");
                RunLog::default()
            }
        };
        let calculator = ScoreCalculator::new(self.settings.score);

        match self
            .registry
            .finalize(self.run_id, &termination, |state| {
                results::build(state, log, pull_request_url, &calculator)
            })
            .await
        {
            Ok(()) => info!(run_id = %self.run_id, ?termination, "Run finished"),
            Err(e) => warn!(run_id = %self.run_id, error = %e, "Run already finalized"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_name() {
        assert_eq!(
            branch_name("Code Warriors", "John Doe"),
            "CODE_WARRIORS_JOHN_DOE_AI_Fix"
        );
        assert_eq!(
            branch_name("  rift-raiders!! ", "o'brien  jr."),
            "RIFT_RAIDERS_OBRIEN_JR_AI_Fix"
        );
        assert_eq!(branch_name("__", "***"), "AI_Fix");
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "panic");
    }
}
