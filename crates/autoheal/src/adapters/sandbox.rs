//! Test execution capability.
//!
//! Runs the test command through `sh -c` inside the working tree, bounded by
//! a timeout, and extracts per-failure reports from the output. With
//! discovery enabled the command comes from the tree's contents, falling back
//! to the configured one.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::discovery;
use crate::capabilities::{RawFailure, Sandbox, TestReport, WorkingTree};
use crate::error::SandboxError;

/// Shell exit status for "command not found".
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// `File "path", line N` frame of a Python traceback.
static FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*File "(?P<file>[^"]+)", line (?P<line>\d+)"#).unwrap());

/// `path:line[:col]: detail` as printed by pytest, flake8, ruff, mypy.
static LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s:]+\.[A-Za-z0-9]+):(?P<line>\d+):(?:\d+:)?\s*(?P<detail>.+)$")
        .unwrap()
});

/// `path(line,col): error TSnnnn: ...` from tsc.
static TSC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s(]+\.tsx?)\((?P<line>\d+),\d+\):\s*(?P<detail>error\s+TS\d+:.+)$")
        .unwrap()
});

/// Exception line, e.g. `SyntaxError: expected ':'`.
static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][\w.]*(?:Error|Exception)\b(?::.*)?$").unwrap()
});

/// Stack frame from jest (`at fn (path:line:col)`) or vitest (`❯ path:line:col`).
static JS_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:at (?:.+ \()?|❯ )(?P<file>[^\s():]+\.[cm]?[jt]sx?):(?P<line>\d+):\d+\)?$")
        .unwrap()
});

/// pytest section separators.
static SEPARATOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[_=]{3,}").unwrap());

/// Extract failure reports from test output.
///
/// Understands Python tracebacks (including pytest's `E`-prefixed ones),
/// `path:line: detail` lines, tsc diagnostics, and jest or vitest failure
/// blocks (reported at their first frame outside `node_modules`). Duplicate reports for
/// the same location and message are dropped.
#[must_use]
pub fn extract_failures(output: &str) -> Vec<RawFailure> {
    let mut failures = Vec::new();
    let mut seen = HashSet::new();
    let mut frame: Option<(String, u32)> = None;
    let mut pending_detail: Option<String> = None;
    let mut block: Vec<&str> = Vec::new();
    // Title of the current jest/vitest failure and its first detail line
    let mut js_test: Option<(String, Option<String>)> = None;

    let mut emit = |file: &str, line: u32, message: String, raw: String| {
        if seen.insert((file.to_string(), line, message.clone())) {
            failures.push(RawFailure {
                file: file.to_string(),
                line,
                message,
                raw,
            });
        }
    };

    for text in output.lines() {
        if SEPARATOR.is_match(text) {
            frame = None;
            pending_detail = None;
            js_test = None;
            block.clear();
            continue;
        }

        let stripped = text.trim();
        if let Some(title) = stripped
            .strip_prefix('●')
            .or_else(|| stripped.strip_prefix("FAIL "))
        {
            js_test = Some((title.trim().to_string(), None));
            block.clear();
            block.push(text);
            continue;
        }
        block.push(text);

        if let Some(caps) = JS_FRAME.captures(text) {
            let file = &caps["file"];
            if !file.contains("node_modules") {
                if let (Some((title, detail)), Ok(line)) = (js_test.take(), caps["line"].parse()) {
                    emit(file, line, detail.unwrap_or(title), block.join("\n"));
                    block.clear();
                }
            }
            continue;
        }
        if let Some((_, detail @ None)) = js_test.as_mut() {
            if !stripped.is_empty() {
                *detail = Some(stripped.to_string());
            }
        }

        let (body, is_detail) = match text.strip_prefix("E ") {
            Some(rest) => (rest.trim(), true),
            None => (text, false),
        };

        if let Some(caps) = FRAME.captures(body) {
            frame = caps["line"].parse().ok().map(|n| (caps["file"].to_string(), n));
            continue;
        }

        if let Some(caps) = TSC.captures(body) {
            if let Ok(line) = caps["line"].parse() {
                emit(&caps["file"], line, caps["detail"].to_string(), text.to_string());
            }
            continue;
        }

        if !is_detail {
            if let Some(caps) = LOCATION.captures(body) {
                let Ok(line) = caps["line"].parse::<u32>() else {
                    continue;
                };
                let detail = caps["detail"].trim();
                if let Some(function) = detail.strip_prefix("in ") {
                    debug!(file = &caps["file"], function, "Traceback frame");
                    frame = Some((caps["file"].to_string(), line));
                    continue;
                }
                let message = match pending_detail.take() {
                    Some(explanation) if !detail.contains(' ') => format!("{detail}: {explanation}"),
                    _ => detail.to_string(),
                };
                emit(&caps["file"], line, message, block.join("\n"));
                frame = None;
                block.clear();
                continue;
            }
        }

        let trimmed = body.trim();
        if ERROR_LINE.is_match(trimmed) {
            if let Some((file, line)) = frame.take() {
                emit(&file, line, trimmed.to_string(), block.join("\n"));
                block.clear();
                pending_detail = None;
                continue;
            }
        }
        if is_detail && frame.is_none() && pending_detail.is_none() && !trimmed.is_empty() {
            pending_detail = Some(trimmed.to_string());
        }
    }

    failures
}

/// Make `file` relative to `root` when it points inside it.
fn relativize(root: &Path, file: &str) -> String {
    Path::new(file)
        .strip_prefix(root)
        .map_or_else(|_| file.to_string(), |p| p.to_string_lossy().to_string())
}

/// Runs a shell command as the test suite.
#[derive(Debug, Clone)]
pub struct CommandSandbox {
    test_command: String,
    timeout: Duration,
    discover: bool,
}

impl CommandSandbox {
    #[must_use]
    pub fn new(test_command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            test_command: test_command.into(),
            timeout,
            discover: false,
        }
    }

    /// Pick the command per run from the working tree's test framework.
    #[must_use]
    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discover = enabled;
        self
    }

    async fn command_for(&self, tree: &WorkingTree) -> String {
        if !self.discover {
            return self.test_command.clone();
        }
        let root = tree.path.clone();
        match tokio::task::spawn_blocking(move || discovery::best_command(&root)).await {
            Ok(Some(command)) => command,
            Ok(None) => {
                debug!(fallback = %self.test_command, "No test framework detected");
                self.test_command.clone()
            }
            Err(e) => {
                warn!(error = %e, "Test framework discovery failed");
                self.test_command.clone()
            }
        }
    }
}

#[async_trait]
impl Sandbox for CommandSandbox {
    async fn run_tests(&self, tree: &WorkingTree) -> Result<TestReport, SandboxError> {
        let command = self.command_for(tree).await;
        info!(%command, path = %tree.path().display(), "Running tests");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(tree.path())
            .env("CI", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    SandboxError::Unavailable(format!("Cannot start test command: {e}"))
                }
                _ => SandboxError::Io(e.to_string()),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| SandboxError::Io(e.to_string()))?,
            Err(_) => return Err(SandboxError::TimedOut(self.timeout.as_secs())),
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            combined.push('\n');
            combined.push_str(&stderr);
        }

        if output.status.code() == Some(EXIT_COMMAND_NOT_FOUND) {
            return Err(SandboxError::Unavailable(format!(
                "Test command not found: {}",
                stderr.trim()
            )));
        }

        let passed = output.status.success();
        let failures = if passed {
            Vec::new()
        } else {
            extract_failures(&combined)
                .into_iter()
                .map(|mut f| {
                    f.file = relativize(tree.path(), &f.file);
                    f
                })
                .collect()
        };

        info!(passed, failures = failures.len(), "Test run finished");
        Ok(TestReport {
            passed,
            failures,
            output: combined,
        })
    }
}
