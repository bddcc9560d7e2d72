//! Error types for the remediation core and its collaborators.

use thiserror::Error;

use crate::remediation::types::{RunId, RunStatus};

/// Errors raised by the run registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No run with this identifier has been created
    #[error("Run {0} not found")]
    NotFound(RunId),

    /// A status change would move a run backwards or out of a terminal state
    #[error("Invalid status transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    /// Iteration counter would leave `[0, max_iterations]`
    #[error("Iteration {iteration} out of range for run {run_id} (max {max_iterations})")]
    IterationOutOfRange {
        run_id: RunId,
        iteration: u32,
        max_iterations: u32,
    },
}

/// Errors raised while validating a remediation request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StartError {
    /// A required request field is empty
    #[error("Required field '{0}' must not be empty")]
    EmptyField(&'static str),

    /// Requested iteration budget is zero or above the configured ceiling
    #[error("max_iterations must be between 1 and {ceiling}, got {requested}")]
    InvalidMaxIterations { requested: u32, ceiling: u32 },
}

/// Errors from the repository capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepoError {
    /// Credentials rejected; never retried
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Remote rejected the update (non-fast-forward, merge conflict)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Remote unreachable or connection dropped
    #[error("Network error: {0}")]
    Network(String),

    /// Local command failed for another reason
    #[error("Git command failed: {0}")]
    Command(String),
}

impl RepoError {
    /// Authentication failures end the run immediately.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Errors from the CI capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CiError {
    /// Network blip or 5xx; safe to poll again
    #[error("Transient CI query error: {0}")]
    Transient(String),

    /// Bad credentials, unknown pipeline, malformed response
    #[error("CI query failed: {0}")]
    Fatal(String),
}

impl CiError {
    /// Check if the query can be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors from the sandboxed execution capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    /// The sandbox cannot run at all (missing runtime, bad command)
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    /// The test command exceeded its time limit
    #[error("Test execution timed out after {0}s")]
    TimedOut(u64),

    /// I/O failure while collecting output
    #[error("Sandbox I/O error: {0}")]
    Io(String),
}

impl SandboxError {
    /// Check if the test run can be retried in place.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TimedOut(_) | Self::Io(_))
    }
}

/// Errors from the diagnosis and fix-generation capabilities.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    /// The failure does not match anything the capability understands
    #[error("Unclassified failure: {0}")]
    Unclassified(String),

    /// Remote model call failed
    #[error("Model request failed: {0}")]
    Request(String),

    /// Model answered with something unusable
    #[error("Invalid model response: {0}")]
    InvalidResponse(String),

    /// Source file could not be read for context
    #[error("Context unavailable: {0}")]
    Context(String),
}

/// Errors while applying a patch to the working tree.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatchError {
    /// Target file does not exist in the working tree
    #[error("File not found: {0}")]
    FileMissing(String),

    /// Target line is past the end of the file
    #[error("Line {line} out of range for {file} ({len} lines)")]
    LineOutOfRange { file: String, line: u32, len: usize },

    /// Target line no longer matches what the patch expected
    #[error("Patch conflict in {file} line {line}: expected {expected:?}, found {found:?}")]
    Conflict {
        file: String,
        line: u32,
        expected: String,
        found: String,
    },

    /// Path escapes the working tree
    #[error("Refusing to patch path outside the working tree: {0}")]
    OutsideTree(String),

    /// Read or write failed
    #[error("Patch I/O error: {0}")]
    Io(String),
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override could not be parsed
    #[error("Invalid value '{value}' for {key}")]
    InvalidEnv { key: &'static str, value: String },

    /// Values are individually valid but inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_error_fatality() {
        assert!(RepoError::Auth("bad token".into()).is_fatal());
        assert!(!RepoError::Conflict("rejected".into()).is_fatal());
        assert!(!RepoError::Network("reset".into()).is_fatal());
        assert!(!RepoError::Command("exit 1".into()).is_fatal());
    }

    #[test]
    fn test_transient_classification() {
        assert!(CiError::Transient("502".into()).is_transient());
        assert!(!CiError::Fatal("401".into()).is_transient());
        assert!(SandboxError::TimedOut(300).is_transient());
        assert!(!SandboxError::Unavailable("no python".into()).is_transient());
    }

    #[test]
    fn test_error_messages() {
        let err = PatchError::LineOutOfRange {
            file: "src/app.py".into(),
            line: 40,
            len: 12,
        };
        assert_eq!(
            err.to_string(),
            "Line 40 out of range for src/app.py (12 lines)"
        );
        assert_eq!(
            StartError::EmptyField("repo_url").to_string(),
            "Required field 'repo_url' must not be empty"
        );
    }
}
