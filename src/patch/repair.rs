//! Best-effort repair for a narrow set of patch defects.
//!
//! Two rewrites are attempted:
//! - a hunk header missing an optional count or its closing `@@` gets counts
//!   recomputed from its body, provided the body is well delimited
//! - a `new file mode` section missing its `---`/`+++` lines gets them
//!   synthesized from the `diff --git` header
//!
//! Anything else (prose inside a body, a body running into an unterminated
//! end of input) is left alone and the caller rejects the patch.

use regex::Regex;
use std::sync::LazyLock;

use super::parser::git_header_path;

static STRICT_HUNK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -\d+,\d+ \+\d+,\d+ @@").unwrap());

static LENIENT_HUNK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))?(?: @@(.*))?\s*$").unwrap()
});

/// One rewrite applied to the patch text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    HunkHeader { line: usize, from: String, to: String },
    NewFileHeaders { path: String },
}

impl std::fmt::Display for Repair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Repair::HunkHeader { line, from, to } => {
                write!(f, "line {}: rewrote hunk header '{}' as '{}'", line, from, to)
            }
            Repair::NewFileHeaders { path } => {
                write!(f, "added missing ---/+++ headers for new file {}", path)
            }
        }
    }
}

/// Attempt the known repairs. Returns `None` when nothing could be fixed.
pub fn repair(text: &str) -> Option<(String, Vec<Repair>)> {
    let mut repairs = Vec::new();
    let lines = add_new_file_headers(text, &mut repairs);
    let lines = recount_hunk_headers(lines, text.ends_with('\n'), &mut repairs)?;

    if repairs.is_empty() {
        return None;
    }
    let mut out = lines.join("\n");
    if text.ends_with('\n') {
        out.push('\n');
    }
    Some((out, repairs))
}

fn add_new_file_headers(text: &str, repairs: &mut Vec<Repair>) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_header = false;
    let mut git_path: Option<String> = None;
    let mut is_new = false;
    let mut has_headers = false;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            in_header = true;
            git_path = git_header_path(rest);
            is_new = false;
            has_headers = false;
        } else if in_header {
            if line.starts_with("new file mode") {
                is_new = true;
            } else if line.starts_with("--- ") || line.starts_with("+++ ") {
                has_headers = true;
            } else if line.starts_with("@@") {
                in_header = false;
                if is_new
                    && !has_headers
                    && let Some(path) = &git_path
                {
                    out.push("--- /dev/null".to_string());
                    out.push(format!("+++ b/{}", path));
                    repairs.push(Repair::NewFileHeaders { path: path.clone() });
                }
            }
        }
        out.push(line.to_string());
    }
    out
}

fn is_delimiter(lines: &[String], idx: usize) -> bool {
    let line = &lines[idx];
    line.starts_with("@@")
        || line.starts_with("diff --git ")
        || line.starts_with("```")
        || (line.starts_with("--- ")
            && lines.get(idx + 1).is_some_and(|next| next.starts_with("+++ ")))
}

fn recount_hunk_headers(
    mut lines: Vec<String>,
    ends_with_newline: bool,
    repairs: &mut Vec<Repair>,
) -> Option<Vec<String>> {
    for idx in 0..lines.len() {
        let header = lines[idx].clone();
        if !header.starts_with("@@") || STRICT_HUNK_REGEX.is_match(&header) {
            continue;
        }
        let caps = LENIENT_HUNK_REGEX.captures(&header)?;

        let mut end = idx + 1;
        while end < lines.len() && !is_delimiter(&lines, end) {
            end += 1;
        }
        if end == lines.len() && !ends_with_newline {
            return None;
        }

        let mut body = &lines[idx + 1..end];
        while let Some((last, rest)) = body.split_last() {
            if last.is_empty() {
                body = rest;
            } else {
                break;
            }
        }
        if body.is_empty() {
            return None;
        }

        let (mut old_count, mut new_count) = (0usize, 0usize);
        for line in body {
            match line.chars().next() {
                Some(' ') | None => {
                    old_count += 1;
                    new_count += 1;
                }
                Some('-') => old_count += 1,
                Some('+') => new_count += 1,
                Some('\\') => {}
                _ => return None,
            }
        }

        let old_start = &caps[1];
        let new_start = &caps[3];
        let suffix = caps.get(5).map(|m| m.as_str()).unwrap_or("");
        let rewritten = format!(
            "@@ -{},{} +{},{} @@{}",
            old_start, old_count, new_start, new_count, suffix
        );
        repairs.push(Repair::HunkHeader {
            line: idx + 1,
            from: header,
            to: rewritten.clone(),
        });
        lines[idx] = rewritten;
    }
    Some(lines)
}
