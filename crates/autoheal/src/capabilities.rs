//! Collaborator capabilities consumed by the remediation loop.
//!
//! The loop never talks to git, CI, a test runner, or a model directly. It
//! goes through these traits, and the concrete implementations live in
//! [`crate::adapters`]. Tests substitute scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CapabilityError, CiError, PatchError, RepoError, SandboxError};
use crate::remediation::types::{BugType, FailureRecord};

// =============================================================================
// Repository
// =============================================================================

/// A local checkout owned by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingTree {
    /// Checkout directory
    pub path: PathBuf,
    /// Remote the tree was cloned from
    pub repo_url: String,
    /// Branch checked out right after cloning, used as the PR base
    pub base_branch: String,
}

impl WorkingTree {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A commit created in a working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    pub sha: String,
}

/// A fork created because the run could not push to the target repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkRef {
    /// Clone URL of the fork
    pub repo_url: String,
    /// Account owning the fork, used to qualify the PR head
    pub owner: String,
    /// False when the fork was still being provisioned when we gave up waiting
    pub ready: bool,
}

/// Pull request to open for the remediation branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestDraft {
    /// Repository the pull request targets
    pub repo_url: String,
    pub title: String,
    pub body: String,
    /// Branch carrying the fixes, `owner:branch` when pushed to a fork
    pub head: String,
    /// Branch to merge into
    pub base: String,
}

/// A single-line rewrite of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Path relative to the working tree root
    pub file: String,
    /// 1-based line to replace
    pub line: u32,
    /// Current content of the line; the patch conflicts if it differs
    #[serde(default)]
    pub expected: Option<String>,
    /// Lines to put in its place. Empty deletes the line.
    pub replacement: Vec<String>,
    /// Short human summary, used in commit messages
    pub description: String,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Whether the configured identity can push to `repo_url`.
    async fn can_push(&self, _repo_url: &str) -> Result<bool, RepoError> {
        Ok(true)
    }

    /// Fork `repo_url` under the configured identity.
    async fn fork(&self, repo_url: &str) -> Result<ForkRef, RepoError> {
        Err(RepoError::Command(format!("forking is not supported for {repo_url}")))
    }

    /// Clone `repo_url` into a fresh working tree.
    async fn clone_repo(&self, repo_url: &str) -> Result<WorkingTree, RepoError>;

    /// Create and check out `branch`.
    async fn create_branch(&self, tree: &WorkingTree, branch: &str) -> Result<(), RepoError>;

    /// Stage everything and commit.
    async fn commit(&self, tree: &WorkingTree, message: &str) -> Result<CommitRef, RepoError>;

    /// Push `branch` to the remote.
    async fn push(&self, tree: &WorkingTree, branch: &str) -> Result<(), RepoError>;

    /// Open a pull request and return its URL.
    async fn open_pull_request(
        &self,
        tree: &WorkingTree,
        draft: &PullRequestDraft,
    ) -> Result<String, RepoError>;

    /// Apply `patch` to the working tree.
    async fn apply_patch(&self, tree: &WorkingTree, patch: &Patch) -> Result<(), PatchError> {
        crate::patch::apply(tree.path(), patch).await
    }

    /// Release the working tree.
    async fn discard(&self, _tree: &WorkingTree) -> Result<(), RepoError> {
        Ok(())
    }
}

// =============================================================================
// CI
// =============================================================================

/// Identifies the pipeline triggered by a pushed commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRef {
    pub repo_url: String,
    pub branch: String,
    pub commit_sha: String,
}

/// Pipeline status as reported by the CI provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Pending,
    Passed,
    Failed,
}

/// CI provider. Queries must be idempotent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CiProvider: Send + Sync {
    async fn query_status(&self, pipeline: &PipelineRef) -> Result<PipelineStatus, CiError>;

    /// Summary of what failed, fed back into fix generation.
    async fn fetch_logs(&self, pipeline: &PipelineRef) -> Result<String, CiError>;
}

// =============================================================================
// Sandbox
// =============================================================================

/// One failing test as reported by the test runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFailure {
    pub file: String,
    pub line: u32,
    pub message: String,
    /// Output block the failure was extracted from
    pub raw: String,
}

/// Outcome of one test execution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TestReport {
    pub passed: bool,
    pub failures: Vec<RawFailure>,
    /// Combined stdout and stderr
    pub output: String,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run_tests(&self, tree: &WorkingTree) -> Result<TestReport, SandboxError>;
}

// =============================================================================
// Diagnosis and fix generation
// =============================================================================

#[async_trait]
pub trait Diagnoser: Send + Sync {
    /// Assign a bug-type tag to one failure.
    async fn classify(&self, failure: &RawFailure) -> Result<BugType, CapabilityError>;
}

/// What a planner may look at besides the failure itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixContext {
    /// Working tree root
    pub root: PathBuf,
    pub iteration: u32,
    /// Failure summary from the previous CI run, if any
    pub ci_log: Option<String>,
}

#[async_trait]
pub trait FixPlanner: Send + Sync {
    /// Propose a patch, or `None` when the failure is out of reach.
    async fn plan(
        &self,
        failure: &FailureRecord,
        context: &FixContext,
    ) -> Result<Option<Patch>, CapabilityError>;
}
