//! Final results assembly.

use chrono::Utc;

use super::memory::RunLog;
use super::score::ScoreCalculator;
use super::types::{CiStatus, FinalResults, RunState, RunStatus};

/// Build the results snapshot for a run in its terminal state.
///
/// Failures and fixes are ordered by `(file, line)`; equal keys keep their
/// append order. The final CI status is the last recorded check. A run that
/// completed without any CI check (tests green from the start) reports
/// `PASSED`; any other run without a check reports `FAILED`.
///
/// `status` and `final_ci_status` are independent. A run completes when a
/// local test pass or a green CI check ends the loop, so a run whose last
/// CI check failed can still complete on a later local pass. Such a run
/// reports `completed` with `FAILED` and carries a message saying so.
#[must_use]
pub fn build(
    state: &RunState,
    log: RunLog,
    pull_request_url: Option<String>,
    calculator: &ScoreCalculator,
) -> FinalResults {
    let RunLog {
        mut failures,
        mut fixes,
        ci_timeline,
        git_operations,
    } = log;

    failures.sort_by(|a, b| (&a.file, a.line).cmp(&(&b.file, b.line)));
    fixes.sort_by(|a, b| (&a.file, a.line).cmp(&(&b.file, b.line)));

    let final_ci_status = match ci_timeline.last() {
        Some(entry) => entry.status,
        None if state.status == RunStatus::Completed => CiStatus::Passed,
        None => CiStatus::Failed,
    };

    let runtime_seconds = state.runtime_seconds();
    let score = calculator.calculate(runtime_seconds, state.total_commits);
    let message = match state.status {
        RunStatus::Completed if final_ci_status == CiStatus::Failed => {
            Some("Completed on local test pass; last CI check failed".to_string())
        }
        RunStatus::Completed => None,
        _ => Some(state.latest_message.clone()),
    };

    FinalResults {
        run_id: state.id,
        repository_url: state.repo_url.clone(),
        branch: state.branch.clone(),
        team_name: state.team_name.clone(),
        leader_name: state.leader_name.clone(),
        status: state.status,
        message,
        iterations_used: state.current_iteration,
        max_iterations: state.max_iterations,
        total_failures_detected: state.total_failures_detected,
        total_fixes_applied: state.total_fixes_applied,
        final_ci_status,
        runtime_seconds,
        failures_detected: failures,
        fixes,
        ci_timeline,
        git_operations,
        pull_request_url,
        score,
        generated_at: Utc::now(),
    }
}
