//! Fix generation.
//!
//! [`RuleFixPlanner`] handles the mechanical cases (indentation, missing
//! colons and brackets, unused imports) without any network access.
//! [`ChatFixPlanner`] asks an OpenAI-compatible chat endpoint for a
//! replacement line. [`LayeredPlanner`] tries them in that order.
//!
//! Every planner refuses to touch test files.

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capabilities::{FixContext, FixPlanner, Patch};
use crate::error::{CapabilityError, PatchError};
use crate::patch;
use crate::remediation::types::{BugType, FailureRecord};

/// Replacement blocks longer than this are rejected.
pub const MAX_CHANGED_LINES: usize = 20;

/// Lines of context on each side of the failing line sent to the model.
const SNIPPET_RADIUS: usize = 15;

/// CI log excerpt sent to the model.
const CI_LOG_EXCERPT: usize = 2000;

const DEFAULT_INDENT_UNIT: usize = 4;

static TEST_FILE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(^|/)test_[^/]+\.py$").unwrap(),
        Regex::new(r"(^|/)[^/]+_test\.py$").unwrap(),
        Regex::new(r"(^|/)[^/]+\.(test|spec)\.(js|ts|jsx|tsx|mjs|cjs)$").unwrap(),
        Regex::new(r"(^|/)__tests__/").unwrap(),
        Regex::new(r"(^|/)tests?/test_").unwrap(),
        Regex::new(r"(^|/)conftest\.py$").unwrap(),
    ]
});

/// flake8 and ruff both name the unused symbol, quoted or backticked.
static UNUSED_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"['`](?P<name>[\w.]+)['`] imported but unused").unwrap());

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^```[\w+-]*\s*$").unwrap());

/// Whether `file` looks like a test file.
#[must_use]
pub fn is_test_file(file: &str) -> bool {
    TEST_FILE_PATTERNS.iter().any(|p| p.is_match(file))
}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Most common indentation step in `lines`, defaulting to four spaces.
#[must_use]
pub fn detect_indent_unit(lines: &[String]) -> usize {
    let mut indents: Vec<usize> = lines
        .iter()
        .filter(|l| {
            let t = l.trim_start();
            !t.is_empty() && !t.starts_with('#')
        })
        .map(|l| indent_width(l))
        .filter(|w| *w > 0)
        .collect();
    indents.sort_unstable();
    indents.dedup();

    let Some(&smallest) = indents.first() else {
        return DEFAULT_INDENT_UNIT;
    };

    let mut steps: HashMap<usize, usize> = HashMap::new();
    for pair in indents.windows(2) {
        *steps.entry(pair[1] - pair[0]).or_default() += 1;
    }
    steps
        .into_iter()
        .max_by_key(|(step, count)| (*count, std::cmp::Reverse(*step)))
        .map_or(smallest, |(step, _)| step)
}

/// Re-indent `lines[index]` to match the enclosing block.
fn fix_indentation(lines: &[String], index: usize) -> Option<String> {
    let previous = lines[..index].iter().rev().find(|l| !l.trim().is_empty())?;
    let mut expected = indent_width(previous);
    if previous.trim_end().ends_with(':') {
        let others: Vec<String> = lines
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, l)| l.clone())
            .collect();
        expected += detect_indent_unit(&others);
    }

    let current = &lines[index];
    if indent_width(current) == expected {
        return None;
    }
    Some(format!("{}{}", " ".repeat(expected), current.trim_start()))
}

/// Closing brackets needed to balance `line`.
fn missing_brackets(line: &str) -> String {
    let mut stack = Vec::new();
    for c in line.chars() {
        match c {
            '(' => stack.push(')'),
            '[' => stack.push(']'),
            '{' => stack.push('}'),
            ')' | ']' | '}' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    stack.iter().rev().collect()
}

/// Drop `name` from an `import` statement. `None` deletes the whole line.
fn remove_import(line: &str, name: &str) -> Option<Option<String>> {
    let indent = &line[..indent_width(line)];
    let statement = line.trim();
    let leaf = name.rsplit('.').next().unwrap_or(name);

    let (head, items, target) = if let Some(rest) = statement.strip_prefix("import ") {
        ("import ".to_string(), rest, name)
    } else if let Some(rest) = statement.strip_prefix("from ") {
        let (module, items) = rest.split_once(" import ")?;
        (format!("from {module} import "), items, leaf)
    } else {
        return None;
    };
    if items.contains('(') || items.contains('\\') {
        return None;
    }

    let all: Vec<&str> = items.split(',').map(str::trim).collect();
    let kept: Vec<&str> = all
        .iter()
        .copied()
        .filter(|item| {
            let item = *item;
            let bound = item.split(" as ").last().unwrap_or(item).trim();
            item != target && bound != leaf && bound != target
        })
        .collect();

    if kept.len() == all.len() {
        return None;
    }
    if kept.is_empty() {
        return Some(None);
    }
    Some(Some(format!("{indent}{head}{}", kept.join(", "))))
}

/// Deterministic fix for the failure at `failure.line`.
///
/// Returns the replacement lines and a description, or `None` when no rule
/// applies.
#[must_use]
pub fn rule_fix(lines: &[String], failure: &FailureRecord) -> Option<(Vec<String>, String)> {
    let line_no = failure.line as usize;
    if line_no == 0 || line_no > lines.len() {
        return None;
    }
    let index = line_no - 1;
    let current = &lines[index];
    let message = failure.message.to_lowercase();

    match failure.bug_type {
        BugType::Indentation => {
            if index == 0 {
                return None;
            }
            fix_indentation(lines, index)
                .map(|fixed| (vec![fixed], format!("Fixed indentation at line {line_no}")))
        }
        BugType::Syntax => {
            let trimmed = current.trim_end();
            if message.contains("expected ':'") && !trimmed.ends_with(':') {
                return Some((
                    vec![format!("{trimmed}:")],
                    format!("Added missing colon at line {line_no}"),
                ));
            }
            let closes = missing_brackets(trimmed);
            if !closes.is_empty()
                && ["never closed", "unexpected eof", "expected"]
                    .iter()
                    .any(|hint| message.contains(hint))
            {
                return Some((
                    vec![format!("{trimmed}{closes}")],
                    format!("Added missing bracket(s) '{closes}' at line {line_no}"),
                ));
            }
            None
        }
        BugType::Linting => {
            let caps = UNUSED_IMPORT.captures(&failure.message)?;
            let name = &caps["name"];
            let replacement = remove_import(current, name)?;
            Some((
                replacement.into_iter().collect(),
                format!("Removed unused import '{name}' at line {line_no}"),
            ))
        }
        BugType::Logic | BugType::TypeError | BugType::Import => None,
    }
}

fn context_error(e: &PatchError) -> CapabilityError {
    CapabilityError::Context(e.to_string())
}

/// Planner for the mechanical failure classes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleFixPlanner;

impl RuleFixPlanner {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FixPlanner for RuleFixPlanner {
    async fn plan(
        &self,
        failure: &FailureRecord,
        context: &FixContext,
    ) -> Result<Option<Patch>, CapabilityError> {
        if is_test_file(&failure.file) {
            debug!(file = %failure.file, "Skipping test file");
            return Ok(None);
        }
        let lines = match patch::read_lines(&context.root, &failure.file).await {
            Ok(lines) => lines,
            Err(PatchError::FileMissing(_)) => return Ok(None),
            Err(e) => return Err(context_error(&e)),
        };

        let Some((replacement, description)) = rule_fix(&lines, failure) else {
            return Ok(None);
        };
        debug!(file = %failure.file, line = failure.line, %description, "Rule fix");
        Ok(Some(Patch {
            file: failure.file.clone(),
            line: failure.line,
            expected: Some(lines[failure.line as usize - 1].clone()),
            replacement,
            description,
        }))
    }
}

// =============================================================================
// Model-backed planner
// =============================================================================

/// Connection settings for an OpenAI-compatible chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatPlannerConfig {
    pub api_base: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for ChatPlannerConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

const SYSTEM_PROMPT: &str = "You are a precise code fixer. Return only corrected source lines. \
No markdown. No explanations. Minimal changes.";

/// Remove a surrounding markdown fence if the model added one anyway.
fn strip_fences(content: &str) -> Vec<String> {
    let mut lines: Vec<&str> = content.trim_matches('\n').lines().collect();
    if lines.first().is_some_and(|l| CODE_FENCE.is_match(l.trim())) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    lines.into_iter().map(str::to_string).collect()
}

/// Planner that asks a chat model for a replacement of the failing line.
#[derive(Debug, Clone)]
pub struct ChatFixPlanner {
    client: reqwest::Client,
    config: ChatPlannerConfig,
}

impl ChatFixPlanner {
    /// Build a planner for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: ChatPlannerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, config })
    }

    fn prompt(lines: &[String], failure: &FailureRecord, context: &FixContext) -> String {
        let line_no = failure.line as usize;
        let start = line_no.saturating_sub(SNIPPET_RADIUS + 1);
        let end = (line_no + SNIPPET_RADIUS).min(lines.len());

        let mut snippet = String::new();
        for (offset, line) in lines[start..end].iter().enumerate() {
            let _ = writeln!(snippet, "{:4} | {line}", start + offset + 1);
        }

        let mut prompt = format!(
            "Fix the following bug by rewriting line {line_no} only.\n\
             Return ONLY the corrected source for line {line_no}: no explanation, no markdown \
             fences, no line numbers. The result may span several lines. Preserve indentation, \
             quotes and names.\n\n\
             File: {file}\nBug type: {bug_type}\nMessage: {message}\nFix hint: {hint}\n\n\
             Code around line {line_no}:\n{snippet}",
            file = failure.file,
            bug_type = failure.bug_type,
            message = failure.message,
            hint = failure.bug_type.fix_hint(),
        );
        if let Some(log) = context.ci_log.as_deref().filter(|l| !l.trim().is_empty()) {
            let excerpt: String = log.chars().take(CI_LOG_EXCERPT).collect();
            let _ = write!(prompt, "\nPrevious CI run:\n{excerpt}\n");
        }
        prompt
    }

    async fn complete(&self, prompt: String) -> Result<String, CapabilityError> {
        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.config.model,
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| CapabilityError::Request(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Request(format!(
                "Model API error: {status} - {body}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::InvalidResponse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| CapabilityError::InvalidResponse("No choices returned".to_string()))
    }
}

#[async_trait]
impl FixPlanner for ChatFixPlanner {
    async fn plan(
        &self,
        failure: &FailureRecord,
        context: &FixContext,
    ) -> Result<Option<Patch>, CapabilityError> {
        if is_test_file(&failure.file) {
            return Ok(None);
        }
        let lines = match patch::read_lines(&context.root, &failure.file).await {
            Ok(lines) => lines,
            Err(PatchError::FileMissing(_)) => return Ok(None),
            Err(e) => return Err(context_error(&e)),
        };
        let line_no = failure.line as usize;
        if line_no == 0 || line_no > lines.len() {
            return Ok(None);
        }
        let current = lines[line_no - 1].clone();

        let content = self.complete(Self::prompt(&lines, failure, context)).await?;
        let replacement = strip_fences(&content);

        if replacement.is_empty() || replacement == [current.clone()] {
            debug!(file = %failure.file, line = failure.line, "Model proposed no change");
            return Ok(None);
        }
        if replacement.len() > MAX_CHANGED_LINES {
            warn!(
                file = %failure.file,
                lines = replacement.len(),
                limit = MAX_CHANGED_LINES,
                "Rejecting oversized model fix"
            );
            return Ok(None);
        }

        info!(file = %failure.file, line = failure.line, model = %self.config.model, "Model fix");
        Ok(Some(Patch {
            file: failure.file.clone(),
            line: failure.line,
            expected: Some(current),
            replacement,
            description: format!("Model fix for {} at line {line_no}", failure.bug_type),
        }))
    }
}

/// Rules first, then the model when one is configured.
#[derive(Debug, Clone, Default)]
pub struct LayeredPlanner {
    rules: RuleFixPlanner,
    model: Option<ChatFixPlanner>,
}

impl LayeredPlanner {
    #[must_use]
    pub fn new(model: Option<ChatFixPlanner>) -> Self {
        Self {
            rules: RuleFixPlanner::new(),
            model,
        }
    }
}

#[async_trait]
impl FixPlanner for LayeredPlanner {
    async fn plan(
        &self,
        failure: &FailureRecord,
        context: &FixContext,
    ) -> Result<Option<Patch>, CapabilityError> {
        if let Some(patch) = self.rules.plan(failure, context).await? {
            return Ok(Some(patch));
        }
        match &self.model {
            Some(model) => model.plan(failure, context).await,
            None => Ok(None),
        }
    }
}
