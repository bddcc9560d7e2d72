//! Test framework discovery.
//!
//! Scans a working tree for the config files, dependency declarations and
//! test file naming used by pytest, unittest, jest and vitest. Each detector
//! accumulates weighted evidence; the framework with the most confidence
//! supplies the test command.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

/// Directories never scanned, in addition to any dot-directory.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    "venv",
    "env",
    "dist",
    "build",
    "coverage",
];

/// Files remembered wherever they appear in the tree (first match wins).
const CONFIG_FILES: &[&str] = &[
    "package.json",
    "pyproject.toml",
    "requirements.txt",
    "setup.cfg",
    "pytest.ini",
    "conftest.py",
    "jest.config.js",
    "jest.config.ts",
    "jest.config.mjs",
    "jest.config.cjs",
    "vitest.config.js",
    "vitest.config.ts",
    "vitest.config.mts",
    "vite.config.ts",
    "vite.config.js",
];

const JS_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs"];

/// Below this a detector reports nothing.
const MIN_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Pytest,
    Unittest,
    Jest,
    Vitest,
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pytest => "pytest",
            Self::Unittest => "unittest",
            Self::Jest => "jest",
            Self::Vitest => "vitest",
        };
        f.write_str(name)
    }
}

/// One detected framework and the command that runs it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameworkMatch {
    pub framework: Framework,
    pub command: String,
    /// 0.0 to 1.0
    pub confidence: f64,
    /// Why the detector fired
    pub evidence: Vec<String>,
}

/// Files collected once per scan and shared by the detectors.
#[derive(Debug, Default)]
struct ScanContext {
    root: PathBuf,
    py_files: Vec<PathBuf>,
    js_files: Vec<PathBuf>,
    config_files: HashMap<&'static str, PathBuf>,
    package_json: Option<Value>,
    pyproject: Option<String>,
    requirements: Option<String>,
}

impl ScanContext {
    fn build(root: &Path) -> Self {
        let mut ctx = Self {
            root: root.to_path_buf(),
            ..Self::default()
        };

        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped(e))
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("py") => ctx.py_files.push(path.to_path_buf()),
                Some(ext) if JS_EXTENSIONS.contains(&ext) => ctx.js_files.push(path.to_path_buf()),
                _ => {}
            }
            let name = entry.file_name().to_string_lossy();
            if let Some(known) = CONFIG_FILES.iter().find(|c| **c == name) {
                ctx.config_files
                    .entry(*known)
                    .or_insert_with(|| path.to_path_buf());
            }
        }

        ctx.package_json = ctx
            .read_config("package.json")
            .and_then(|text| serde_json::from_str(&text).ok());
        ctx.pyproject = ctx.read_config("pyproject.toml");
        ctx.requirements = ctx.read_config("requirements.txt");

        debug!(
            root = %root.display(),
            py = ctx.py_files.len(),
            js = ctx.js_files.len(),
            configs = ?ctx.config_files.keys().collect::<Vec<_>>(),
            "Scanned working tree"
        );
        ctx
    }

    fn has_config(&self, name: &str) -> bool {
        self.config_files.contains_key(name)
    }

    fn read_config(&self, name: &str) -> Option<String> {
        let path = self.config_files.get(name)?;
        std::fs::read_to_string(path).ok()
    }

    fn has_dir(&self, name: &str) -> bool {
        self.root.join(name).is_dir()
    }

    fn has_dependency(&self, name: &str) -> bool {
        self.package_json.as_ref().is_some_and(|pkg| {
            ["dependencies", "devDependencies"]
                .iter()
                .any(|section| pkg.get(section).and_then(|deps| deps.get(name)).is_some())
        })
    }

    /// `scripts.test` from package.json, lowercased.
    fn test_script(&self) -> Option<String> {
        self.package_json
            .as_ref()?
            .get("scripts")?
            .get("test")?
            .as_str()
            .map(str::to_lowercase)
    }

    fn python_test_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.py_files.iter().filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("test_") || n.ends_with("_test.py"))
        })
    }

    fn js_test_files(&self) -> usize {
        self.js_files
            .iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(".test.") || n.contains(".spec."))
            })
            .count()
    }

    fn has_pytest_config(&self) -> bool {
        self.has_config("conftest.py")
            || self.has_config("pytest.ini")
            || self
                .pyproject
                .as_deref()
                .is_some_and(|t| t.contains("[tool.pytest"))
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.') || SKIP_DIRS.contains(&name))
}

/// Weighted evidence gathered by one detector.
#[derive(Default)]
struct Evidence {
    confidence: f64,
    notes: Vec<String>,
}

impl Evidence {
    fn add(&mut self, weight: f64, note: impl Into<String>) {
        self.confidence += weight;
        self.notes.push(note.into());
    }

    fn into_match(self, framework: Framework, command: impl Into<String>) -> Option<FrameworkMatch> {
        (self.confidence >= MIN_CONFIDENCE).then(|| FrameworkMatch {
            framework,
            command: command.into(),
            confidence: self.confidence.min(1.0),
            evidence: self.notes,
        })
    }
}

fn detect_pytest(ctx: &ScanContext) -> Option<FrameworkMatch> {
    let mut ev = Evidence::default();
    if ctx.has_config("conftest.py") {
        ev.add(0.4, "conftest.py found");
    }
    if ctx.has_config("pytest.ini") {
        ev.add(0.3, "pytest.ini found");
    }
    if let Some(pyproject) = &ctx.pyproject {
        if pyproject.contains("[tool.pytest") {
            ev.add(0.3, "[tool.pytest] section in pyproject.toml");
        }
        if pyproject.contains("pytest") {
            ev.add(0.2, "pytest referenced in pyproject.toml");
        }
    }
    if ctx
        .read_config("setup.cfg")
        .is_some_and(|t| t.contains("[tool:pytest]"))
    {
        ev.add(0.3, "[tool:pytest] in setup.cfg");
    }
    if ctx
        .requirements
        .as_deref()
        .is_some_and(|t| t.lines().any(|l| l.trim_start().starts_with("pytest")))
    {
        ev.add(0.3, "pytest listed in requirements.txt");
    }
    let test_files = ctx.python_test_files().count();
    if test_files > 0 {
        ev.add(0.2, format!("{test_files} file(s) matching test_*.py or *_test.py"));
    }
    if ctx.has_dir("tests") || ctx.has_dir("test") {
        ev.add(0.1, "tests/ directory found");
    }
    ev.into_match(Framework::Pytest, "python -m pytest -q")
}

fn detect_unittest(ctx: &ScanContext) -> Option<FrameworkMatch> {
    let importers = ctx
        .python_test_files()
        .filter(|p| {
            std::fs::read_to_string(p).is_ok_and(|text| {
                text.lines().any(|l| {
                    let l = l.trim_start();
                    l.starts_with("import unittest") || l.starts_with("from unittest")
                })
            })
        })
        .count();

    let mut ev = Evidence::default();
    if importers > 0 {
        let extra = f64::from(u8::try_from(importers.min(3)).unwrap_or(3)) * 0.1;
        ev.add(0.3 + extra, format!("{importers} file(s) import unittest"));
        if !ctx.has_pytest_config() {
            ev.add(0.2, "no pytest config, unittest is the primary runner");
        }
    }

    let command = if ctx.has_dir("tests") {
        "python -m unittest discover -s tests -v"
    } else {
        "python -m unittest discover -v"
    };
    ev.into_match(Framework::Unittest, command)
}

fn detect_jest(ctx: &ScanContext) -> Option<FrameworkMatch> {
    let mut ev = Evidence::default();
    if let Some(config) = CONFIG_FILES
        .iter()
        .find(|c| c.starts_with("jest.config") && ctx.has_config(c))
    {
        ev.add(0.5, format!("config file {config}"));
    }
    if ctx.has_dependency("jest") {
        ev.add(0.4, "jest in package.json dependencies");
    }
    if ctx.has_dependency("ts-jest") || ctx.has_dependency("@jest/core") {
        ev.add(0.2, "ts-jest or @jest/core in package.json dependencies");
    }
    let script_runs_jest = ctx.test_script().is_some_and(|s| s.contains("jest"));
    if script_runs_jest {
        ev.add(0.3, "package.json scripts.test runs jest");
    }
    if ctx
        .package_json
        .as_ref()
        .is_some_and(|pkg| pkg.get("jest").is_some())
    {
        ev.add(0.3, "jest block in package.json");
    }
    let test_files = ctx.js_test_files();
    if test_files > 0 {
        ev.add(0.15, format!("{test_files} test/spec file(s)"));
    }
    if ctx.has_dir("__tests__") {
        ev.add(0.1, "__tests__/ directory found");
    }

    let command = if script_runs_jest { "npm test" } else { "npx jest" };
    ev.into_match(Framework::Jest, command)
}

fn detect_vitest(ctx: &ScanContext) -> Option<FrameworkMatch> {
    let mut ev = Evidence::default();
    let config = CONFIG_FILES
        .iter()
        .find(|c| c.starts_with("vitest.config") && ctx.has_config(c));
    if let Some(config) = config {
        ev.add(0.5, format!("config file {config}"));
    }
    let mut vitest_referenced = config.is_some();
    for vite in ["vite.config.ts", "vite.config.js"] {
        let Some(text) = ctx.read_config(vite) else {
            continue;
        };
        if text.to_lowercase().contains("vitest") {
            ev.add(0.4, format!("vitest referenced in {vite}"));
            vitest_referenced = true;
        }
        if text.contains("test:") || text.contains("test :") {
            ev.add(0.2, format!("test block in {vite}"));
        }
    }
    if ctx.has_dependency("vitest") {
        ev.add(0.5, "vitest in package.json dependencies");
        vitest_referenced = true;
    }
    let script_runs_vitest = ctx.test_script().is_some_and(|s| s.contains("vitest"));
    if script_runs_vitest {
        ev.add(0.3, "package.json scripts.test runs vitest");
        vitest_referenced = true;
    }
    let test_files = ctx.js_test_files();
    if vitest_referenced && test_files > 0 {
        ev.add(0.1, format!("{test_files} test/spec file(s)"));
    }

    let command = if script_runs_vitest {
        "npm test"
    } else {
        "npx vitest run"
    };
    ev.into_match(Framework::Vitest, command)
}

/// Every framework detected under `root`, most confident first, one entry
/// per distinct command.
#[must_use]
pub fn discover(root: &Path) -> Vec<FrameworkMatch> {
    if !root.is_dir() {
        return Vec::new();
    }
    let ctx = ScanContext::build(root);

    let mut matches: Vec<FrameworkMatch> = [detect_pytest, detect_unittest, detect_jest, detect_vitest]
        .iter()
        .filter_map(|detect| detect(&ctx))
        .collect();
    matches.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut seen = Vec::new();
    matches.retain(|m| {
        if seen.contains(&m.command) {
            false
        } else {
            seen.push(m.command.clone());
            true
        }
    });

    info!(
        root = %root.display(),
        frameworks = ?matches.iter().map(|m| m.framework.to_string()).collect::<Vec<_>>(),
        "Discovered test frameworks"
    );
    matches
}

/// Command of the most likely framework under `root`, if any.
#[must_use]
pub fn best_command(root: &Path) -> Option<String> {
    discover(root).into_iter().next().map(|m| m.command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        dir
    }

    #[test]
    fn test_detects_pytest() {
        let dir = repo(&[
            ("conftest.py", ""),
            ("requirements.txt", "requests==2.31\npytest>=7\n"),
            ("tests/test_calc.py", "def test_add():\n    assert add(2, 3) == 5\n"),
        ]);
        let found = discover(dir.path());
        assert_eq!(found[0].framework, Framework::Pytest);
        assert_eq!(found[0].command, "python -m pytest -q");
        assert!((found[0].confidence - 1.0).abs() < f64::EPSILON);
        assert!(found[0].evidence.iter().any(|e| e.contains("conftest.py")));
    }

    #[test]
    fn test_detects_unittest_without_pytest_config() {
        let dir = repo(&[(
            "tests/test_models.py",
            "import unittest\n\nclass ModelTest(unittest.TestCase):\n    pass\n",
        )]);
        let found = discover(dir.path());
        assert_eq!(found[0].framework, Framework::Unittest);
        assert_eq!(found[0].command, "python -m unittest discover -s tests -v");
        // pytest only sees the file naming and the tests/ directory
        if let Some(pytest) = found.iter().find(|m| m.framework == Framework::Pytest) {
            assert!(pytest.confidence < found[0].confidence);
        }
    }

    #[test]
    fn test_detects_jest_via_npm_script() {
        let dir = repo(&[
            (
                "package.json",
                r#"{"scripts": {"test": "jest --ci"}, "devDependencies": {"jest": "^29.0.0"}}"#,
            ),
            ("src/sum.test.js", "test('adds', () => {});\n"),
        ]);
        let found = discover(dir.path());
        assert_eq!(found[0].framework, Framework::Jest);
        assert_eq!(found[0].command, "npm test");
    }

    #[test]
    fn test_detects_jest_config_without_script() {
        let dir = repo(&[("jest.config.js", "module.exports = {};\n")]);
        assert_eq!(best_command(dir.path()).as_deref(), Some("npx jest"));
    }

    #[test]
    fn test_detects_vitest() {
        let dir = repo(&[
            ("package.json", r#"{"devDependencies": {"vitest": "^1.6.0"}}"#),
            ("vitest.config.ts", "export default {}\n"),
            ("src/sum.test.ts", "it('adds', () => {})\n"),
        ]);
        let found = discover(dir.path());
        assert_eq!(found[0].framework, Framework::Vitest);
        assert_eq!(found[0].command, "npx vitest run");
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_skips_vendored_directories() {
        let dir = repo(&[
            ("node_modules/jest/jest.config.js", ""),
            (".venv/lib/conftest.py", ""),
            ("README.md", "nothing to test\n"),
        ]);
        assert!(discover(dir.path()).is_empty());
        assert_eq!(best_command(dir.path()), None);
    }

    #[test]
    fn test_missing_root() {
        assert!(discover(Path::new("/nonexistent/heal_tree")).is_empty());
    }
}
