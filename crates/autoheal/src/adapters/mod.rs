//! Concrete capability implementations.
//!
//! - `git`: repository capability over the `git` CLI
//! - `github` / `github_actions`: GitHub REST client and the CI capability built on it
//! - `sandbox`: test execution in a subprocess
//! - `discovery`: picks the test command from the repository contents
//! - `classifier`: rule-based diagnosis
//! - `fixer`: rule-based fix generation with an optional model fallback

pub mod classifier;
pub mod discovery;
pub mod fixer;
pub mod git;
pub mod github;
pub mod github_actions;
pub mod sandbox;

use regex::Regex;
use std::sync::LazyLock;

// Re-export primary types
pub use classifier::RuleClassifier;
pub use fixer::{ChatFixPlanner, ChatPlannerConfig, LayeredPlanner, RuleFixPlanner};
pub use git::GitCli;
pub use github::GitHubClient;
pub use github_actions::GitHubActions;
pub use sandbox::CommandSandbox;

static GITHUB_REPO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"github\.com[:/](?P<owner>[\w.-]+)/(?P<repo>[\w.-]+?)(?:\.git)?/?$").unwrap()
});

/// Split a GitHub URL (https or ssh form) into `(owner, repo)`.
#[must_use]
pub fn parse_owner_repo(url: &str) -> Option<(String, String)> {
    let caps = GITHUB_REPO.captures(url.trim())?;
    Some((caps["owner"].to_string(), caps["repo"].to_string()))
}
