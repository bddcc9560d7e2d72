//! Rule-based failure diagnosis.
//!
//! Each bug type has a bank of patterns. Banks are tried in a fixed
//! priority order, first against the failure message and then against the
//! raw output block, so the most specific tag wins.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

use crate::capabilities::{Diagnoser, RawFailure};
use crate::error::CapabilityError;
use crate::remediation::types::BugType;

static INDENTATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"IndentationError|TabError").unwrap(),
        Regex::new(r"(?i)unexpected indent|unindent does not match").unwrap(),
        Regex::new(r"(?i)expected an indented block").unwrap(),
        Regex::new(r"\bE11[1-7]\b|\bW191\b").unwrap(), // pycodestyle indentation codes
    ]
});

static SYNTAX_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"SyntaxError").unwrap(),
        Regex::new(r"(?i)invalid syntax").unwrap(),
        Regex::new(r"expected ':'").unwrap(),
        Regex::new(r"(?i)was never closed|unmatched '[)\]}]'").unwrap(),
        Regex::new(r"\bE999\b").unwrap(),
    ]
});

static IMPORT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"ImportError|ModuleNotFoundError").unwrap(),
        Regex::new(r"No module named").unwrap(),
        Regex::new(r"Cannot find module").unwrap(),
    ]
});

static TYPE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\bTypeError\b").unwrap(),
        Regex::new(r"\bTS\d{4}\b").unwrap(), // TypeScript errors
        Regex::new(r"(?i)incompatible type").unwrap(),
    ]
});

static LINT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\b[EWFCB]\d{3}\b").unwrap(), // flake8 / ruff codes
        Regex::new(r"imported but unused").unwrap(),
        Regex::new(r"(?i)unused import").unwrap(),
        Regex::new(r"(?i)line too long").unwrap(),
    ]
});

static LOGIC_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"AssertionError").unwrap(),
        Regex::new(r"\bassert\b").unwrap(),
        Regex::new(r"expect\(").unwrap(),
    ]
});

/// Pattern banks in priority order.
static RULES: LazyLock<Vec<(BugType, &'static LazyLock<Vec<Regex>>)>> = LazyLock::new(|| {
    vec![
        (BugType::Indentation, &INDENTATION_PATTERNS),
        (BugType::Syntax, &SYNTAX_PATTERNS),
        (BugType::Import, &IMPORT_PATTERNS),
        (BugType::TypeError, &TYPE_PATTERNS),
        (BugType::Linting, &LINT_PATTERNS),
        (BugType::Logic, &LOGIC_PATTERNS),
    ]
});

/// Classify `text` against the rule banks.
#[must_use]
pub fn classify_text(text: &str) -> Option<BugType> {
    RULES
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| p.is_match(text)))
        .map(|(bug_type, _)| *bug_type)
}

/// Diagnoser backed by [`classify_text`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleClassifier;

impl RuleClassifier {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Diagnoser for RuleClassifier {
    async fn classify(&self, failure: &RawFailure) -> Result<BugType, CapabilityError> {
        let bug_type = classify_text(&failure.message)
            .or_else(|| classify_text(&failure.raw))
            .ok_or_else(|| {
                CapabilityError::Unclassified(format!(
                    "{}:{}: {}",
                    failure.file, failure.line, failure.message
                ))
            })?;
        debug!(file = %failure.file, line = failure.line, %bug_type, "Classified failure");
        Ok(bug_type)
    }
}
