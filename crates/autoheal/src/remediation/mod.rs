//! Bounded iterative remediation loop.
//!
//! This module provides the remediation core:
//! - Registers runs and owns their observable state
//! - Records failures, fixes, CI checks, and git operations per run
//! - Drives each run through the fixed stage cycle until CI passes or the
//!   iteration budget runs out
//! - Waits on CI with bounded backoff and cancellation
//! - Scores finished runs

pub mod ci_waiter;
pub mod machine;
pub mod memory;
pub mod orchestrator;
pub mod registry;
pub mod results;
pub mod score;
pub mod types;

// Re-export primary types
pub use ci_waiter::{CiOutcome, CiWaitConfig, CiWaiter};
pub use machine::{Capabilities, IterationStateMachine, LoopExit, LoopSettings};
pub use memory::{RunLog, RunMemory};
pub use orchestrator::{branch_name, Orchestrator, OrchestratorSettings, RunResults};
pub use registry::{RunRegistry, Termination};
pub use score::{ScoreBreakdown, ScoreCalculator, ScoreConfig};
pub use types::{
    BugType, CiStatus, CiTimelineEntry, FailureRecord, FinalResults, FixRecord, FixStatus,
    GitOpStatus, GitOperation, GitStage, RunId, RunRequest, RunState, RunStatus, Stage,
};
