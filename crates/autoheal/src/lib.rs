//! Autoheal: autonomous repository remediation.
//!
//! Clones a repository, runs its tests, patches what fails, and pushes the
//! fixes to a dedicated branch until CI passes or the iteration budget runs
//! out.
//!
//! - [`remediation`]: the bounded iterative loop and its run bookkeeping
//! - [`capabilities`]: traits for git, CI, test execution, diagnosis, fixes
//! - [`adapters`]: concrete capability implementations
//! - [`server`]: HTTP surface over the orchestrator

pub mod adapters;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod patch;
pub mod remediation;
pub mod server;

// Re-export primary types
pub use config::Config;
pub use remediation::{FinalResults, Orchestrator, RunId, RunRequest};
