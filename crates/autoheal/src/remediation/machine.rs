//! Iteration state machine.
//!
//! Drives one run through the fixed stage cycle
//!
//! ```text
//! RUN_TESTS -> CLASSIFY -> PLAN_FIX -> APPLY_PATCH -> COMMIT_PUSH
//!           -> WAIT_FOR_CI -> FETCH_CI_RESULTS -> VERIFY
//! ```
//!
//! with a single loop-back edge from VERIFY to RUN_TESTS while the
//! iteration budget lasts. Each stage handler returns a [`Transition`];
//! [`IterationStateMachine::run`] is the only place that moves between
//! stages. The machine is the sole writer of its run's state and records.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ci_waiter::{CiOutcome, CiWaitConfig, CiWaiter};
use super::memory::RunMemory;
use super::registry::RunRegistry;
use super::types::{
    CiStatus, CiTimelineEntry, FailureRecord, FixRecord, FixStatus, GitOpStatus, GitOperation,
    GitStage, RunId, Stage,
};
use crate::capabilities::{
    CiProvider, Diagnoser, FixContext, FixPlanner, Patch, PipelineRef, Repository, Sandbox,
    TestReport, WorkingTree,
};
use crate::error::RegistryError;

/// Maximum fix lines listed in a batched commit message.
const COMMIT_MESSAGE_FIX_LINES: usize = 8;

/// The collaborators a run depends on.
#[derive(Clone)]
pub struct Capabilities {
    pub repository: Arc<dyn Repository>,
    pub ci: Arc<dyn CiProvider>,
    pub sandbox: Arc<dyn Sandbox>,
    pub diagnoser: Arc<dyn Diagnoser>,
    pub planner: Arc<dyn FixPlanner>,
}

/// Retry and naming knobs for the loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Push attempts before the run fails
    pub push_attempts: u32,
    /// Base delay between push attempts, multiplied by the attempt number
    pub push_backoff: Duration,
    /// Extra test executions after a transient sandbox error
    pub transient_retries: u32,
    /// Marks commits and pull requests as automated
    pub commit_prefix: String,
    pub ci_wait: CiWaitConfig,
    /// Hard limit for one CI wait
    pub ci_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            push_attempts: 3,
            push_backoff: Duration::from_secs(2),
            transient_retries: 2,
            commit_prefix: "[AI-AGENT]".to_string(),
            ci_wait: CiWaitConfig::default(),
            ci_timeout: Duration::from_secs(600),
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Tests or CI came back green
    Remediated,
    /// Budget used up without a passing CI run
    Exhausted,
    /// Unrecoverable stage error
    Fatal(String),
    Cancelled,
}

/// Outcome of one stage handler.
#[derive(Debug)]
enum Transition {
    Next(Stage),
    NextIteration,
    Exit(LoopExit),
}

/// Data handed from one stage to the next within an iteration.
#[derive(Debug, Default)]
struct IterationScratch {
    report: Option<TestReport>,
    failures: Vec<FailureRecord>,
    planned: Vec<(FailureRecord, Patch)>,
    applied: Vec<Patch>,
    pipeline: Option<PipelineRef>,
    ci_outcome: Option<CiOutcome>,
}

type StageResult = Result<Transition, RegistryError>;

/// Batched commit message for one iteration.
#[must_use]
pub fn commit_message(prefix: &str, iteration: u32, applied: &[Patch]) -> String {
    let mut message = format!(
        "{prefix} Iteration {iteration}: {} fix(es) applied",
        applied.len()
    );
    if !applied.is_empty() {
        message.push('\n');
    }
    for patch in applied.iter().take(COMMIT_MESSAGE_FIX_LINES) {
        message.push_str(&format!("\n  - {}: {}", patch.file, patch.description));
    }
    if applied.len() > COMMIT_MESSAGE_FIX_LINES {
        message.push_str(&format!(
            "\n  ... and {} more",
            applied.len() - COMMIT_MESSAGE_FIX_LINES
        ));
    }
    message
}

/// Runs the stage cycle for one run.
pub struct IterationStateMachine {
    run_id: RunId,
    max_iterations: u32,
    registry: Arc<RunRegistry>,
    memory: Arc<RunMemory>,
    caps: Capabilities,
    settings: LoopSettings,
    waiter: CiWaiter,
    tree: WorkingTree,
    branch: String,
    cancel: CancellationToken,
    /// CI failure summary carried into the next iteration's planning
    ci_log: Option<String>,
}

impl IterationStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        max_iterations: u32,
        registry: Arc<RunRegistry>,
        memory: Arc<RunMemory>,
        caps: Capabilities,
        settings: LoopSettings,
        tree: WorkingTree,
        branch: String,
        cancel: CancellationToken,
    ) -> Self {
        let waiter = CiWaiter::new(Arc::clone(&caps.ci), settings.ci_wait);
        Self {
            run_id,
            max_iterations,
            registry,
            memory,
            caps,
            settings,
            waiter,
            tree,
            branch,
            cancel,
            ci_log: None,
        }
    }

    /// Drive the loop to an exit.
    pub async fn run(mut self) -> LoopExit {
        let mut iteration = 1;
        let mut stage = Stage::RunTests;
        let mut scratch = IterationScratch::default();

        loop {
            if self.cancel.is_cancelled() {
                info!(run_id = %self.run_id, iteration, %stage, "Run cancelled");
                return LoopExit::Cancelled;
            }

            let transition = match self.step(stage, iteration, &mut scratch).await {
                Ok(transition) => transition,
                Err(e) => Transition::Exit(LoopExit::Fatal(e.to_string())),
            };

            match transition {
                Transition::Next(next) => stage = next,
                Transition::NextIteration => {
                    iteration += 1;
                    stage = Stage::RunTests;
                    scratch = IterationScratch::default();
                }
                Transition::Exit(exit) => {
                    info!(run_id = %self.run_id, iteration, ?exit, "Remediation loop finished");
                    return exit;
                }
            }
        }
    }

    async fn step(
        &mut self,
        stage: Stage,
        iteration: u32,
        scratch: &mut IterationScratch,
    ) -> StageResult {
        let label = format!(
            "Iteration {iteration}/{}: {}",
            self.max_iterations,
            stage_label(stage)
        );
        self.registry
            .mutate(self.run_id, |s| s.enter_stage(stage, iteration, label))
            .await?;
        debug!(run_id = %self.run_id, iteration, %stage, "Entered stage");

        match stage {
            Stage::RunTests => self.run_tests(scratch).await,
            Stage::Classify => self.classify(iteration, scratch).await,
            Stage::PlanFix => self.plan_fix(iteration, scratch).await,
            Stage::ApplyPatch => self.apply_patch(iteration, scratch).await,
            Stage::CommitPush => self.commit_push(iteration, scratch).await,
            Stage::WaitForCi => Ok(self.wait_for_ci(scratch).await),
            Stage::FetchCiResults => self.fetch_ci_results(iteration, scratch).await,
            Stage::Verify => self.verify(iteration, scratch).await,
        }
    }

    /// Await `fut` unless the run is cancelled first.
    async fn guarded<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }

    async fn set_message(&self, message: String) -> Result<(), RegistryError> {
        self.registry
            .mutate(self.run_id, |s| {
                s.latest_message = message;
                Ok(())
            })
            .await
    }

    async fn record_git(
        &self,
        stage: GitStage,
        status: GitOpStatus,
        message: impl Into<String>,
    ) -> Result<(), RegistryError> {
        self.memory
            .append_git_op(self.run_id, GitOperation::new(stage, status, message))
            .await
    }

    // =========================================================================
    // Stages
    // =========================================================================

    async fn run_tests(&self, scratch: &mut IterationScratch) -> StageResult {
        let mut retries = 0;
        loop {
            let Some(result) = self.guarded(self.caps.sandbox.run_tests(&self.tree)).await else {
                return Ok(Transition::Exit(LoopExit::Cancelled));
            };

            match result {
                Ok(report) if report.passed => {
                    info!(run_id = %self.run_id, "All tests passed");
                    self.set_message("All tests passed".to_string()).await?;
                    return Ok(Transition::Exit(LoopExit::Remediated));
                }
                Ok(report) => {
                    info!(
                        run_id = %self.run_id,
                        failures = report.failures.len(),
                        "Test run failed"
                    );
                    scratch.report = Some(report);
                    return Ok(Transition::Next(Stage::Classify));
                }
                Err(e) if e.is_transient() && retries < self.settings.transient_retries => {
                    retries += 1;
                    warn!(run_id = %self.run_id, error = %e, retries, "Retrying test execution");
                }
                Err(e) => {
                    return Ok(Transition::Exit(LoopExit::Fatal(format!(
                        "Test execution failed: {e}"
                    ))));
                }
            }
        }
    }

    async fn classify(&self, iteration: u32, scratch: &mut IterationScratch) -> StageResult {
        let raw = scratch
            .report
            .take()
            .map(|report| report.failures)
            .unwrap_or_default();

        for failure in &raw {
            let Some(result) = self.guarded(self.caps.diagnoser.classify(failure)).await else {
                return Ok(Transition::Exit(LoopExit::Cancelled));
            };
            match result {
                Ok(bug_type) => {
                    let record = FailureRecord::new(
                        &failure.file,
                        failure.line,
                        bug_type,
                        &failure.message,
                        iteration,
                    );
                    self.memory.append_failure(self.run_id, record.clone()).await?;
                    scratch.failures.push(record);
                }
                Err(e) => {
                    warn!(run_id = %self.run_id, file = %failure.file, error = %e, "Could not classify failure");
                }
            }
        }

        let classified = scratch.failures.len() as u32;
        if classified == 0 {
            warn!(run_id = %self.run_id, iteration, "Tests failed but no failure was classified");
        }
        self.registry
            .mutate(self.run_id, |s| {
                s.total_failures_detected += classified;
                s.latest_message = format!("Iteration {iteration}: {classified} failure(s) classified");
                Ok(())
            })
            .await?;

        Ok(Transition::Next(Stage::PlanFix))
    }

    async fn plan_fix(&self, iteration: u32, scratch: &mut IterationScratch) -> StageResult {
        let context = FixContext {
            root: self.tree.path.clone(),
            iteration,
            ci_log: self.ci_log.clone(),
        };

        for failure in std::mem::take(&mut scratch.failures) {
            let Some(result) = self
                .guarded(self.caps.planner.plan(&failure, &context))
                .await
            else {
                return Ok(Transition::Exit(LoopExit::Cancelled));
            };
            match result {
                Ok(Some(patch)) => scratch.planned.push((failure, patch)),
                Ok(None) => {
                    debug!(run_id = %self.run_id, failure = %failure.description, "No fix proposed");
                }
                Err(e) => {
                    warn!(run_id = %self.run_id, failure = %failure.description, error = %e, "Fix generation failed");
                }
            }
        }

        Ok(Transition::Next(Stage::ApplyPatch))
    }

    async fn apply_patch(&self, iteration: u32, scratch: &mut IterationScratch) -> StageResult {
        for (failure, patch) in std::mem::take(&mut scratch.planned) {
            let Some(result) = self
                .guarded(self.caps.repository.apply_patch(&self.tree, &patch))
                .await
            else {
                return Ok(Transition::Exit(LoopExit::Cancelled));
            };

            let message = format!("{} {}", self.settings.commit_prefix, patch.description);
            let status = match result {
                Ok(()) => FixStatus::Applied,
                Err(e) => {
                    warn!(run_id = %self.run_id, file = %patch.file, line = patch.line, error = %e, "Patch not applied");
                    FixStatus::Failed
                }
            };
            self.memory
                .append_fix(self.run_id, FixRecord::new(&failure, &message, status, iteration))
                .await?;
            if status == FixStatus::Applied {
                scratch.applied.push(patch);
            }
        }

        let applied = scratch.applied.len() as u32;
        self.registry
            .mutate(self.run_id, |s| {
                s.total_fixes_applied += applied;
                s.latest_message = format!("Iteration {iteration}: {applied} fix(es) applied");
                Ok(())
            })
            .await?;

        if applied == 0 {
            info!(run_id = %self.run_id, iteration, "No patch applied, skipping commit and CI");
            return Ok(Transition::Next(Stage::Verify));
        }
        Ok(Transition::Next(Stage::CommitPush))
    }

    async fn commit_push(&self, iteration: u32, scratch: &mut IterationScratch) -> StageResult {
        let message = commit_message(&self.settings.commit_prefix, iteration, &scratch.applied);

        self.record_git(
            GitStage::Commit,
            GitOpStatus::Started,
            format!("Committing {} fix(es)", scratch.applied.len()),
        )
        .await?;
        let Some(result) = self
            .guarded(self.caps.repository.commit(&self.tree, &message))
            .await
        else {
            return Ok(Transition::Exit(LoopExit::Cancelled));
        };
        let commit = match result {
            Ok(commit) => commit,
            Err(e) => {
                self.record_git(GitStage::Commit, GitOpStatus::Error, e.to_string())
                    .await?;
                return Ok(Transition::Exit(LoopExit::Fatal(format!("Commit failed: {e}"))));
            }
        };
        self.record_git(
            GitStage::Commit,
            GitOpStatus::Success,
            format!("Committed {}", short_sha(&commit.sha)),
        )
        .await?;
        self.registry
            .mutate(self.run_id, |s| {
                s.total_commits += 1;
                Ok(())
            })
            .await?;

        let attempts = self.settings.push_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            self.record_git(
                GitStage::Push,
                GitOpStatus::Started,
                format!("Pushing to {} (attempt {attempt}/{attempts})", self.branch),
            )
            .await?;

            let Some(result) = self
                .guarded(self.caps.repository.push(&self.tree, &self.branch))
                .await
            else {
                return Ok(Transition::Exit(LoopExit::Cancelled));
            };

            match result {
                Ok(()) => {
                    self.record_git(
                        GitStage::Push,
                        GitOpStatus::Success,
                        format!("Pushed {} to {}", short_sha(&commit.sha), self.branch),
                    )
                    .await?;
                    scratch.pipeline = Some(PipelineRef {
                        repo_url: self.tree.repo_url.clone(),
                        branch: self.branch.clone(),
                        commit_sha: commit.sha,
                    });
                    return Ok(Transition::Next(Stage::WaitForCi));
                }
                Err(e) if e.is_fatal() => {
                    self.record_git(GitStage::Push, GitOpStatus::Error, e.to_string())
                        .await?;
                    return Ok(Transition::Exit(LoopExit::Fatal(format!("Push failed: {e}"))));
                }
                Err(e) => {
                    warn!(run_id = %self.run_id, attempt, error = %e, "Push failed");
                    self.record_git(GitStage::Push, GitOpStatus::Error, e.to_string())
                        .await?;
                    last_error = e.to_string();
                    if attempt < attempts {
                        let backoff = self.settings.push_backoff * attempt;
                        if self.guarded(tokio::time::sleep(backoff)).await.is_none() {
                            return Ok(Transition::Exit(LoopExit::Cancelled));
                        }
                    }
                }
            }
        }

        Ok(Transition::Exit(LoopExit::Fatal(format!(
            "Push failed after {attempts} attempt(s): {last_error}"
        ))))
    }

    async fn wait_for_ci(&self, scratch: &mut IterationScratch) -> Transition {
        let Some(pipeline) = scratch.pipeline.as_ref() else {
            return Transition::Next(Stage::Verify);
        };
        let outcome = self
            .waiter
            .wait(pipeline, self.settings.ci_timeout, &self.cancel)
            .await;
        if outcome == CiOutcome::Cancelled {
            return Transition::Exit(LoopExit::Cancelled);
        }
        scratch.ci_outcome = Some(outcome);
        Transition::Next(Stage::FetchCiResults)
    }

    async fn fetch_ci_results(&mut self, iteration: u32, scratch: &mut IterationScratch) -> StageResult {
        let status = match scratch.ci_outcome.as_ref() {
            Some(CiOutcome::Passed) => CiStatus::Passed,
            Some(CiOutcome::Failed) => CiStatus::Failed,
            Some(CiOutcome::Timeout) => {
                warn!(run_id = %self.run_id, iteration, "CI did not finish in time");
                self.set_message(format!("Iteration {iteration}: CI timed out"))
                    .await?;
                return Ok(Transition::Next(Stage::Verify));
            }
            Some(CiOutcome::PollError(e)) => {
                warn!(run_id = %self.run_id, iteration, error = %e, "CI status unavailable");
                self.set_message(format!("Iteration {iteration}: CI status unavailable: {e}"))
                    .await?;
                return Ok(Transition::Next(Stage::Verify));
            }
            Some(CiOutcome::Cancelled) | None => return Ok(Transition::Next(Stage::Verify)),
        };

        self.memory
            .append_ci(
                self.run_id,
                CiTimelineEntry {
                    iteration,
                    status,
                    timestamp: chrono::Utc::now(),
                },
            )
            .await?;
        self.registry
            .mutate(self.run_id, |s| {
                s.latest_ci_status = Some(status);
                s.latest_message = format!("Iteration {iteration}: CI {status}");
                Ok(())
            })
            .await?;

        if status == CiStatus::Failed {
            if let Some(pipeline) = scratch.pipeline.as_ref() {
                match self.guarded(self.caps.ci.fetch_logs(pipeline)).await {
                    Some(Ok(log)) => self.ci_log = Some(log),
                    Some(Err(e)) => {
                        debug!(run_id = %self.run_id, error = %e, "CI logs unavailable");
                    }
                    None => return Ok(Transition::Exit(LoopExit::Cancelled)),
                }
            }
        }

        Ok(Transition::Next(Stage::Verify))
    }

    async fn verify(&self, iteration: u32, scratch: &mut IterationScratch) -> StageResult {
        if scratch.ci_outcome == Some(CiOutcome::Passed) {
            let verified = self.memory.mark_verified(self.run_id, iteration).await?;
            info!(run_id = %self.run_id, iteration, verified, "CI passed");
            return Ok(Transition::Exit(LoopExit::Remediated));
        }

        if iteration < self.max_iterations {
            info!(run_id = %self.run_id, iteration, "Iteration did not pass CI, retrying");
            return Ok(Transition::NextIteration);
        }

        info!(run_id = %self.run_id, iteration, "Iteration budget exhausted");
        Ok(Transition::Exit(LoopExit::Exhausted))
    }
}

fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::RunTests => "running tests",
        Stage::Classify => "classifying failures",
        Stage::PlanFix => "planning fixes",
        Stage::ApplyPatch => "applying patches",
        Stage::CommitPush => "committing and pushing",
        Stage::WaitForCi => "waiting for CI",
        Stage::FetchCiResults => "fetching CI results",
        Stage::Verify => "verifying",
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(file: &str) -> Patch {
        Patch {
            file: file.to_string(),
            line: 1,
            expected: None,
            replacement: vec![],
            description: "remove unused import".to_string(),
        }
    }

    #[test]
    fn test_commit_message_lists_fixes() {
        let message = commit_message("[AI-AGENT]", 2, &[patch("a.py"), patch("b.py")]);
        assert_eq!(
            message,
            "[AI-AGENT] Iteration 2: 2 fix(es) applied\n\n  - a.py: remove unused import\n  - b.py: remove unused import"
        );
    }

    #[test]
    fn test_commit_message_truncates() {
        let applied: Vec<_> = (0..11).map(|i| patch(&format!("f{i}.py"))).collect();
        let message = commit_message("[AI-AGENT]", 1, &applied);
        assert!(message.starts_with("[AI-AGENT] Iteration 1: 11 fix(es) applied"));
        assert_eq!(message.matches("\n  - ").count(), 8);
        assert!(message.ends_with("\n  ... and 3 more"));
    }

    #[test]
    fn test_short_sha() {
        assert_eq!(short_sha("0123456789abcdef"), "01234567");
        assert_eq!(short_sha("abc"), "abc");
    }
}
