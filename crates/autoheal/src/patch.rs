//! Line-oriented patch application.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::capabilities::Patch;
use crate::error::PatchError;

/// Resolve `file` under `root`, refusing absolute paths and `..` segments.
pub fn resolve(root: &Path, file: &str) -> Result<PathBuf, PatchError> {
    let relative = Path::new(file);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if file.is_empty() || escapes {
        return Err(PatchError::OutsideTree(file.to_string()));
    }
    Ok(root.join(relative))
}

/// Read `file` as lines (without terminators).
pub async fn read_lines(root: &Path, file: &str) -> Result<Vec<String>, PatchError> {
    let path = resolve(root, file)?;
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(PatchError::FileMissing(file.to_string())),
        Err(e) => Err(PatchError::Io(format!("{}: {e}", path.display()))),
    }
}

/// Apply `patch` under `root`.
///
/// The target line is compared against `patch.expected` (ignoring trailing
/// whitespace) before anything is written. The file's line ending (`\r\n`
/// or `\n`) and its trailing newline are preserved.
pub async fn apply(root: &Path, patch: &Patch) -> Result<(), PatchError> {
    let path = resolve(root, &patch.file)?;
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(PatchError::FileMissing(patch.file.clone()))
        }
        Err(e) => return Err(PatchError::Io(format!("{}: {e}", path.display()))),
    };

    let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let index = patch.line as usize;
    if index == 0 || index > lines.len() {
        return Err(PatchError::LineOutOfRange {
            file: patch.file.clone(),
            line: patch.line,
            len: lines.len(),
        });
    }

    let current = &lines[index - 1];
    if let Some(expected) = &patch.expected {
        if current.trim_end() != expected.trim_end() {
            return Err(PatchError::Conflict {
                file: patch.file.clone(),
                line: patch.line,
                expected: expected.clone(),
                found: current.clone(),
            });
        }
    }

    lines.splice(index - 1..index, patch.replacement.iter().cloned());

    let mut updated = lines.join(newline);
    if content.ends_with('\n') && !lines.is_empty() {
        updated.push_str(newline);
    }
    tokio::fs::write(&path, updated)
        .await
        .map_err(|e| PatchError::Io(format!("{}: {e}", path.display())))?;

    debug!(file = %patch.file, line = patch.line, "Applied patch");
    Ok(())
}
