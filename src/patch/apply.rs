//! All-or-nothing patch application.
//!
//! Every resulting file is computed in memory first. Only when every hunk
//! has found its place are files written, each through a sibling temp file
//! and a rename. A failure part-way through restores what was already
//! renamed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::parser::{FilePatch, Hunk, ParsedPatch};

/// How far from its declared position a hunk may be found.
pub const MAX_OFFSET: usize = 20;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("{path}: hunk {hunk} context does not match")]
    ContextMismatch { path: String, hunk: usize },

    #[error("{path}: file does not exist")]
    MissingFile { path: String },

    #[error("{path}: new file already exists")]
    AlreadyExists { path: String },

    #[error("{path}: {message}")]
    Io { path: String, message: String },
}

impl ApplyError {
    pub fn path(&self) -> &str {
        match self {
            ApplyError::ContextMismatch { path, .. }
            | ApplyError::MissingFile { path }
            | ApplyError::AlreadyExists { path }
            | ApplyError::Io { path, .. } => path,
        }
    }

    /// Failures the new-file-only direct write can recover from.
    fn is_context_failure(&self) -> bool {
        matches!(self, ApplyError::ContextMismatch { .. })
    }
}

/// Final content for one path; `None` deletes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub original: Option<String>,
    pub content: Option<String>,
}

/// Result of a successful application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub changed_files: Vec<String>,
    pub direct_write: bool,
    /// Changes that restore the tree to its state before the apply.
    pub undo: Vec<FileChange>,
}

#[derive(Debug, Clone)]
struct Doc {
    lines: Vec<String>,
    trailing_newline: bool,
    /// Line ending of the original file, taken from its first line.
    eol: &'static str,
}

impl Doc {
    fn parse(content: &str) -> Self {
        let eol = match content.find('\n') {
            Some(i) if content[..i].ends_with('\r') => "\r\n",
            _ => "\n",
        };
        Self {
            lines: content.lines().map(str::to_string).collect(),
            trailing_newline: content.is_empty() || content.ends_with('\n'),
            eol,
        }
    }

    fn empty() -> Self {
        Self {
            lines: Vec::new(),
            trailing_newline: true,
            eol: "\n",
        }
    }

    fn render(&self) -> String {
        let mut out = self.lines.join(self.eol);
        if self.trailing_newline && !self.lines.is_empty() {
            out.push_str(self.eol);
        }
        out
    }
}

fn read_existing(root: &Path, path: &str) -> Result<Option<String>, ApplyError> {
    let full = root.join(path);
    if !full.exists() {
        return Ok(None);
    }
    std::fs::read_to_string(&full)
        .map(Some)
        .map_err(|e| ApplyError::Io {
            path: path.to_string(),
            message: e.to_string(),
        })
}

fn find_position(lines: &[String], old: &[&str], expected: usize, floor: usize) -> Option<usize> {
    let fits = |pos: usize| {
        pos >= floor
            && pos + old.len() <= lines.len()
            && lines[pos..pos + old.len()]
                .iter()
                .zip(old)
                .all(|(a, b)| a.as_str() == *b)
    };
    if fits(expected) {
        return Some(expected);
    }
    for delta in 1..=MAX_OFFSET {
        if let Some(pos) = expected.checked_sub(delta)
            && fits(pos)
        {
            return Some(pos);
        }
        if fits(expected + delta) {
            return Some(expected + delta);
        }
    }
    None
}

fn apply_hunks(path: &str, doc: &Doc, hunks: &[Hunk]) -> Result<Doc, ApplyError> {
    let mut out = Vec::with_capacity(doc.lines.len());
    let mut cursor = 0usize;

    for (i, hunk) in hunks.iter().enumerate() {
        let old = hunk.old_lines();
        let expected = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let pos = find_position(&doc.lines, &old, expected.max(cursor), cursor).ok_or_else(
            || ApplyError::ContextMismatch {
                path: path.to_string(),
                hunk: i + 1,
            },
        )?;
        out.extend_from_slice(&doc.lines[cursor..pos]);
        out.extend(hunk.new_lines().into_iter().map(str::to_string));
        cursor = pos + old.len();
    }
    out.extend_from_slice(&doc.lines[cursor..]);

    Ok(Doc {
        lines: out,
        trailing_newline: doc.trailing_newline,
        eol: doc.eol,
    })
}

/// Compute the final content of every touched path without writing.
pub fn compute_changes(root: &Path, patch: &ParsedPatch) -> Result<Vec<FileChange>, ApplyError> {
    let mut order: Vec<String> = Vec::new();
    let mut originals: HashMap<String, Option<String>> = HashMap::new();
    let mut working: HashMap<String, Option<Doc>> = HashMap::new();

    let mut load = |path: &str,
                    order: &mut Vec<String>,
                    working: &mut HashMap<String, Option<Doc>>|
     -> Result<Option<Doc>, ApplyError> {
        if let Some(doc) = working.get(path) {
            return Ok(doc.clone());
        }
        let original = read_existing(root, path)?;
        let doc = original.as_deref().map(Doc::parse);
        originals.insert(path.to_string(), original);
        working.insert(path.to_string(), doc.clone());
        order.push(path.to_string());
        Ok(doc)
    };

    for file in &patch.files {
        let source = file.old_path.as_deref().unwrap_or(&file.path);
        let current = load(source, &mut order, &mut working)?;

        let base = if file.is_new {
            if current.as_ref().is_some_and(|d| !d.lines.is_empty()) {
                return Err(ApplyError::AlreadyExists {
                    path: file.path.clone(),
                });
            }
            Doc::empty()
        } else {
            current.ok_or_else(|| ApplyError::MissingFile {
                path: source.to_string(),
            })?
        };

        let result = apply_hunks(&file.path, &base, &file.hunks)?;

        if file.is_delete {
            working.insert(file.path.clone(), None);
        } else if let Some(old) = &file.old_path {
            load(&file.path, &mut order, &mut working)?;
            working.insert(old.clone(), None);
            working.insert(file.path.clone(), Some(result));
        } else {
            working.insert(file.path.clone(), Some(result));
        }
    }

    Ok(order
        .into_iter()
        .map(|path| {
            let original = originals.remove(&path).flatten();
            let content = working.remove(&path).flatten().map(|d| d.render());
            FileChange {
                path,
                original,
                content,
            }
        })
        .filter(|c| c.original != c.content)
        .collect())
}

/// Changes for the direct-write path: each new file gets exactly its added lines.
///
/// Only targets that are absent or empty qualify; existing content is never
/// overwritten.
pub fn direct_changes(root: &Path, patch: &ParsedPatch) -> Result<Vec<FileChange>, ApplyError> {
    patch
        .files
        .iter()
        .map(|file: &FilePatch| {
            let original = read_existing(root, &file.path)?;
            if original.as_deref().is_some_and(|c| !c.is_empty()) {
                return Err(ApplyError::AlreadyExists {
                    path: file.path.clone(),
                });
            }
            let mut content = file.added_lines().collect::<Vec<_>>().join("\n");
            content.push('\n');
            Ok(FileChange {
                path: file.path.clone(),
                original,
                content: Some(content),
            })
        })
        .collect()
}

/// The changes that undo `changes` once they are on disk.
fn inverse(changes: &[FileChange]) -> Vec<FileChange> {
    changes
        .iter()
        .map(|c| FileChange {
            path: c.path.clone(),
            original: c.content.clone(),
            content: c.original.clone(),
        })
        .collect()
}

fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.anvil-tmp-{}", name, uuid::Uuid::new_v4().simple()))
}

fn io_err(path: &str, e: std::io::Error) -> ApplyError {
    ApplyError::Io {
        path: path.to_string(),
        message: e.to_string(),
    }
}

/// Undo log for an in-progress write.
#[derive(Default)]
struct Rollback {
    created_dirs: Vec<PathBuf>,
    temps: Vec<PathBuf>,
    committed: Vec<(PathBuf, Option<String>)>,
}

impl Rollback {
    fn run(self) {
        for temp in &self.temps {
            let _ = std::fs::remove_file(temp);
        }
        for (target, original) in self.committed.iter().rev() {
            let _ = match original {
                Some(content) => std::fs::write(target, content),
                None => std::fs::remove_file(target),
            };
        }
        for dir in self.created_dirs.iter().rev() {
            let _ = std::fs::remove_dir(dir);
        }
    }
}

/// Write the changes atomically; on any error restore the prior state.
pub fn write_changes(root: &Path, changes: &[FileChange]) -> Result<(), ApplyError> {
    let mut rollback = Rollback::default();
    match write_inner(root, changes, &mut rollback) {
        Ok(()) => Ok(()),
        Err(e) => {
            rollback.run();
            Err(e)
        }
    }
}

fn write_inner(root: &Path, changes: &[FileChange], rb: &mut Rollback) -> Result<(), ApplyError> {
    let mut staged = Vec::new();

    for change in changes {
        let Some(content) = &change.content else {
            continue;
        };
        let target = root.join(&change.path);
        if let Some(parent) = target.parent() {
            let mut missing: Vec<PathBuf> = parent
                .ancestors()
                .take_while(|p| !p.exists())
                .map(Path::to_path_buf)
                .collect();
            missing.reverse();
            std::fs::create_dir_all(parent).map_err(|e| io_err(&change.path, e))?;
            rb.created_dirs.extend(missing);
        }
        let temp = temp_path_for(&target);
        std::fs::write(&temp, content).map_err(|e| io_err(&change.path, e))?;
        rb.temps.push(temp.clone());
        staged.push((change, target, temp));
    }

    for (change, target, temp) in staged {
        std::fs::rename(&temp, &target).map_err(|e| io_err(&change.path, e))?;
        rb.temps.retain(|t| t != &temp);
        rb.committed.push((target, change.original.clone()));
    }

    for change in changes.iter().filter(|c| c.content.is_none()) {
        let target = root.join(&change.path);
        if target.exists() {
            std::fs::remove_file(&target).map_err(|e| io_err(&change.path, e))?;
            rb.committed.push((target, change.original.clone()));
        }
    }

    Ok(())
}

/// Apply a parsed patch under `root`.
///
/// A context mismatch on a patch made only of new files falls back to
/// writing their added lines directly, provided none of the targets has
/// content yet. Any other failure leaves the tree untouched.
pub fn apply_patch(root: &Path, patch: &ParsedPatch) -> Result<ApplyOutcome, ApplyError> {
    let (changes, direct_write) = match compute_changes(root, patch) {
        Ok(changes) => (changes, false),
        Err(e) if e.is_context_failure() && patch.all_new() => {
            tracing::warn!(path = e.path(), error = %e, "context mismatch on new-file patch, writing directly");
            (direct_changes(root, patch)?, true)
        }
        Err(e) => return Err(e),
    };

    write_changes(root, &changes)?;

    Ok(ApplyOutcome {
        undo: inverse(&changes),
        changed_files: changes.into_iter().map(|c| c.path).collect(),
        direct_write,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::parser::parse;
    use tempfile::tempdir;

    fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    fn read(root: &Path, path: &str) -> String {
        std::fs::read_to_string(root.join(path)).unwrap()
    }

    #[test]
    fn test_apply_modification_with_offset() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.txt", "header\nextra\none\ntwo\nthree\n");
        let patch = parse("--- a/a.txt\n+++ b/a.txt\n@@ -1,3 +1,3 @@\n one\n-two\n+TWO\n three\n")
            .unwrap();

        let outcome = apply_patch(dir.path(), &patch).unwrap();
        assert_eq!(outcome.changed_files, vec!["a.txt"]);
        assert!(!outcome.direct_write);
        assert_eq!(read(dir.path(), "a.txt"), "header\nextra\none\nTWO\nthree\n");
    }

    #[test]
    fn test_apply_new_file_creates_directories() {
        let dir = tempdir().unwrap();
        let patch = parse("--- /dev/null\n+++ b/src/deep/new.rs\n@@ -0,0 +1,2 @@\n+fn a() {}\n+fn b() {}\n").unwrap();
        apply_patch(dir.path(), &patch).unwrap();
        assert_eq!(read(dir.path(), "src/deep/new.rs"), "fn a() {}\nfn b() {}\n");
    }

    #[test]
    fn test_mixed_patch_context_mismatch_leaves_tree_untouched() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.txt", "alpha\nbeta\n");
        let text = "\
--- /dev/null
+++ b/new.txt
@@ -0,0 +1,1 @@
+fresh
--- a/a.txt
+++ b/a.txt
@@ -1,2 +1,2 @@
 alpha
-gamma
+delta
";
        let patch = parse(text).unwrap();
        let err = apply_patch(dir.path(), &patch).unwrap_err();
        assert_eq!(
            err,
            ApplyError::ContextMismatch {
                path: "a.txt".into(),
                hunk: 1
            }
        );
        assert_eq!(read(dir.path(), "a.txt"), "alpha\nbeta\n");
        assert!(!dir.path().join("new.txt").exists());
    }

    #[test]
    fn test_new_file_only_falls_back_to_direct_write() {
        let dir = tempdir().unwrap();
        write(dir.path(), "empty.txt", "");
        // The context line cannot match a file that does not exist yet.
        let patch = parse(
            "--- /dev/null\n+++ b/gen.txt\n@@ -1,1 +1,2 @@\n header\n+line two\n\
             --- /dev/null\n+++ b/empty.txt\n@@ -0,0 +1,1 @@\n+filled\n",
        )
        .unwrap();

        let outcome = apply_patch(dir.path(), &patch).unwrap();
        assert!(outcome.direct_write);
        assert_eq!(read(dir.path(), "gen.txt"), "line two\n");
        assert_eq!(read(dir.path(), "empty.txt"), "filled\n");
    }

    #[test]
    fn test_new_file_diff_never_overwrites_existing_content() {
        let dir = tempdir().unwrap();
        write(dir.path(), "keep.py", "operator_code = 1\n");
        let patch = parse("--- /dev/null\n+++ b/keep.py\n@@ -0,0 +1,1 @@\n+agent = 2\n").unwrap();

        assert_eq!(
            apply_patch(dir.path(), &patch).unwrap_err(),
            ApplyError::AlreadyExists {
                path: "keep.py".into()
            }
        );
        assert_eq!(read(dir.path(), "keep.py"), "operator_code = 1\n");
    }

    #[test]
    fn test_undo_restores_prior_tree() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.txt", "one\n");
        write(dir.path(), "gone.txt", "bye\n");
        let text = "\
--- a/a.txt
+++ b/a.txt
@@ -1,1 +1,1 @@
-one
+ONE
--- /dev/null
+++ b/src/new.txt
@@ -0,0 +1,1 @@
+fresh
--- a/gone.txt
+++ /dev/null
@@ -1,1 +0,0 @@
-bye
";
        let outcome = apply_patch(dir.path(), &parse(text).unwrap()).unwrap();
        assert_eq!(read(dir.path(), "a.txt"), "ONE\n");

        write_changes(dir.path(), &outcome.undo).unwrap();
        assert_eq!(read(dir.path(), "a.txt"), "one\n");
        assert_eq!(read(dir.path(), "gone.txt"), "bye\n");
        assert!(!dir.path().join("src/new.txt").exists());
    }

    #[test]
    fn test_missing_file_rejected() {
        let dir = tempdir().unwrap();
        let patch = parse("--- a/nope.txt\n+++ b/nope.txt\n@@ -1,1 +1,1 @@\n-a\n+b\n").unwrap();
        assert_eq!(
            apply_patch(dir.path(), &patch).unwrap_err(),
            ApplyError::MissingFile {
                path: "nope.txt".into()
            }
        );
    }

    #[test]
    fn test_delete_file() {
        let dir = tempdir().unwrap();
        write(dir.path(), "old.txt", "bye\n");
        let patch = parse("--- a/old.txt\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-bye\n").unwrap();
        let outcome = apply_patch(dir.path(), &patch).unwrap();
        assert_eq!(outcome.changed_files, vec!["old.txt"]);
        assert!(!dir.path().join("old.txt").exists());
    }

    #[test]
    fn test_rollback_restores_renamed_files() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.txt", "one\n");
        // A directory where a file must go makes the rename fail.
        std::fs::create_dir_all(dir.path().join("blocked.txt/inner")).unwrap();
        let changes = vec![
            FileChange {
                path: "a.txt".into(),
                original: Some("one\n".into()),
                content: Some("two\n".into()),
            },
            FileChange {
                path: "blocked.txt".into(),
                original: None,
                content: Some("x\n".into()),
            },
        ];

        assert!(write_changes(dir.path(), &changes).is_err());
        assert_eq!(read(dir.path(), "a.txt"), "one\n");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("anvil-tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_crlf_line_endings_preserved() {
        let dir = tempdir().unwrap();
        write(dir.path(), "win.txt", "a\r\nb\r\nc\r\n");
        let patch = parse("--- a/win.txt\n+++ b/win.txt\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n").unwrap();

        apply_patch(dir.path(), &patch).unwrap();
        assert_eq!(read(dir.path(), "win.txt"), "a\r\nB\r\nc\r\n");
    }

    #[test]
    fn test_trailing_newline_preserved() {
        let dir = tempdir().unwrap();
        write(dir.path(), "n.txt", "a\nb");
        let patch = parse("--- a/n.txt\n+++ b/n.txt\n@@ -1,2 +1,2 @@\n-a\n+A\n b\n").unwrap();
        apply_patch(dir.path(), &patch).unwrap();
        assert_eq!(read(dir.path(), "n.txt"), "A\nb");
    }
}
