//! Core types for a remediation run.
//!
//! This module defines the primary data structures for:
//! - The live, observable state of a run
//! - The stages of the remediation cycle
//! - The append-only records a run accumulates (failures, fixes, CI checks, git operations)
//! - The final results snapshot handed to callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::score::ScoreBreakdown;
use crate::error::RegistryError;

/// Opaque run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Allocate a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of a run. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal forward move.
    ///
    /// Re-asserting `Running` while running is allowed; leaving a terminal
    /// status never is.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Queued, _) => true,
            (Self::Running, Self::Queued) => false,
            (Self::Running, _) => true,
            (Self::Completed | Self::Failed, _) => false,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the remediation cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    RunTests,
    Classify,
    PlanFix,
    ApplyPatch,
    CommitPush,
    WaitForCi,
    FetchCiResults,
    Verify,
}

impl Stage {
    /// All stages in cycle order.
    pub const CYCLE: [Stage; 8] = [
        Self::RunTests,
        Self::Classify,
        Self::PlanFix,
        Self::ApplyPatch,
        Self::CommitPush,
        Self::WaitForCi,
        Self::FetchCiResults,
        Self::Verify,
    ];

    /// The stage that follows in the fixed order; `None` after `Verify`.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::RunTests => Some(Self::Classify),
            Self::Classify => Some(Self::PlanFix),
            Self::PlanFix => Some(Self::ApplyPatch),
            Self::ApplyPatch => Some(Self::CommitPush),
            Self::CommitPush => Some(Self::WaitForCi),
            Self::WaitForCi => Some(Self::FetchCiResults),
            Self::FetchCiResults => Some(Self::Verify),
            Self::Verify => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunTests => "RUN_TESTS",
            Self::Classify => "CLASSIFY",
            Self::PlanFix => "PLAN_FIX",
            Self::ApplyPatch => "APPLY_PATCH",
            Self::CommitPush => "COMMIT_PUSH",
            Self::WaitForCi => "WAIT_FOR_CI",
            Self::FetchCiResults => "FETCH_CI_RESULTS",
            Self::Verify => "VERIFY",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed bug taxonomy assigned by the diagnosis capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BugType {
    Linting,
    Syntax,
    Logic,
    TypeError,
    Import,
    Indentation,
}

impl BugType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linting => "LINTING",
            Self::Syntax => "SYNTAX",
            Self::Logic => "LOGIC",
            Self::TypeError => "TYPE_ERROR",
            Self::Import => "IMPORT",
            Self::Indentation => "INDENTATION",
        }
    }

    /// Hint passed to fix generation.
    #[must_use]
    pub fn fix_hint(self) -> &'static str {
        match self {
            Self::Syntax => "Check for missing colons, brackets, or parentheses",
            Self::Indentation => "Align indentation to the surrounding block",
            Self::Import => "Verify the module name and remove or correct the import",
            Self::TypeError => "Make argument types match the function signature",
            Self::Logic => "Review the assertion: expected and actual values differ",
            Self::Linting => "Remove the unused import or fix the style violation",
        }
    }
}

impl fmt::Display for BugType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified test failure. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub file: String,
    pub line: u32,
    pub bug_type: BugType,
    pub message: String,
    /// `"{file} - Line {line}: {message}"`
    pub description: String,
    pub iteration: u32,
}

impl FailureRecord {
    #[must_use]
    pub fn new(file: &str, line: u32, bug_type: BugType, message: &str, iteration: u32) -> Self {
        Self {
            file: file.to_string(),
            line,
            bug_type,
            message: message.to_string(),
            description: format!("{file} - Line {line}: {message}"),
            iteration,
        }
    }
}

/// Status of an applied patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixStatus {
    Applied,
    Verified,
    Failed,
}

/// One patch attempt. Only `status` may change, and only `Applied -> Verified`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRecord {
    pub file: String,
    pub bug_type: BugType,
    pub line: u32,
    pub commit_message: String,
    pub status: FixStatus,
    /// `"{BUG_TYPE} error in {file} line {line} -> Fix: {commit_message}"`
    pub description: String,
    pub failure_message: String,
    pub iteration: u32,
}

impl FixRecord {
    #[must_use]
    pub fn new(
        failure: &FailureRecord,
        commit_message: &str,
        status: FixStatus,
        iteration: u32,
    ) -> Self {
        Self {
            file: failure.file.clone(),
            bug_type: failure.bug_type,
            line: failure.line,
            commit_message: commit_message.to_string(),
            status,
            description: format!(
                "{} error in {} line {} -> Fix: {}",
                failure.bug_type, failure.file, failure.line, commit_message
            ),
            failure_message: failure.message.clone(),
            iteration,
        }
    }
}

/// Terminal CI outcome as recorded in the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CiStatus {
    Passed,
    Failed,
}

impl fmt::Display for CiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
        })
    }
}

/// One CI check performed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiTimelineEntry {
    pub iteration: u32,
    pub status: CiStatus,
    pub timestamp: DateTime<Utc>,
}

/// Repository-side action label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitStage {
    /// Forking a repository the run cannot push to
    Fork,
    Clone,
    Branch,
    Commit,
    Push,
    PullRequest,
}

/// Outcome of a repository-side action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitOpStatus {
    Started,
    Success,
    Warning,
    Error,
}

/// One repository-side action attempted by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitOperation {
    pub stage: GitStage,
    pub status: GitOpStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl GitOperation {
    #[must_use]
    pub fn new(stage: GitStage, status: GitOpStatus, message: impl Into<String>) -> Self {
        Self {
            stage,
            status,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Caller request to remediate a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub repo_url: String,
    pub team_name: String,
    pub leader_name: String,
    /// Overrides the configured iteration budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

/// Live, observable state of one run.
///
/// Owned by the registry; the run's state machine is its only writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub id: RunId,
    pub repo_url: String,
    pub team_name: String,
    pub leader_name: String,
    /// Dedicated remediation branch, empty until created
    pub branch: String,
    pub status: RunStatus,
    /// Active stage, `None` when not running
    pub current_step: Option<Stage>,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub latest_message: String,
    pub latest_ci_status: Option<CiStatus>,
    pub total_failures_detected: u32,
    pub total_fixes_applied: u32,
    pub total_commits: u32,
    /// Set only when the run ended on a fatal error
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Create a queued run.
    #[must_use]
    pub fn new(id: RunId, request: &RunRequest, max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            repo_url: request.repo_url.clone(),
            team_name: request.team_name.clone(),
            leader_name: request.leader_name.clone(),
            branch: String::new(),
            status: RunStatus::Queued,
            current_step: None,
            current_iteration: 0,
            max_iterations,
            latest_message: "Queued".to_string(),
            latest_ci_status: None,
            total_failures_detected: 0,
            total_fixes_applied: 0,
            total_commits: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting backwards or post-terminal moves.
    ///
    /// Entering a terminal status clears `current_step` in the same write.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), RegistryError> {
        if !self.status.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                run_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.current_step = None;
        }
        Ok(())
    }

    /// Enter `stage` of `iteration`.
    pub fn enter_stage(
        &mut self,
        stage: Stage,
        iteration: u32,
        message: impl Into<String>,
    ) -> Result<(), RegistryError> {
        self.set_iteration(iteration)?;
        self.current_step = Some(stage);
        self.latest_message = message.into();
        Ok(())
    }

    /// Set the iteration counter, keeping it inside `[0, max_iterations]`.
    pub fn set_iteration(&mut self, iteration: u32) -> Result<(), RegistryError> {
        if iteration > self.max_iterations {
            return Err(RegistryError::IterationOutOfRange {
                run_id: self.id,
                iteration,
                max_iterations: self.max_iterations,
            });
        }
        self.current_iteration = iteration;
        Ok(())
    }

    /// Seconds between creation and the last update.
    #[must_use]
    pub fn runtime_seconds(&self) -> f64 {
        (self.updated_at - self.created_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Serializable snapshot of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResults {
    pub run_id: RunId,
    pub repository_url: String,
    pub branch: String,
    pub team_name: String,
    pub leader_name: String,
    pub status: RunStatus,
    /// Fatal error or exhaustion note, if the run did not complete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub iterations_used: u32,
    pub max_iterations: u32,
    pub total_failures_detected: u32,
    pub total_fixes_applied: u32,
    pub final_ci_status: CiStatus,
    pub runtime_seconds: f64,
    pub failures_detected: Vec<FailureRecord>,
    pub fixes: Vec<FixRecord>,
    pub ci_timeline: Vec<CiTimelineEntry>,
    pub git_operations: Vec<GitOperation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
    pub score: ScoreBreakdown,
    pub generated_at: DateTime<Utc>,
}
