//! Strict unified-diff parser.
//!
//! Accepts git-style and plain unified diffs, tolerates leading prose and a
//! surrounding ``` fence, and rejects anything that looks truncated.

use regex::Regex;
use std::sync::LazyLock;

use super::scope::normalize_path;
use crate::errors::PatchError;

static HUNK_HEADER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+),(\d+) \+(\d+),(\d+) @@").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Lines the hunk expects to find in the original file.
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    /// Lines the hunk leaves in the resulting file.
    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }
}

/// One file section of a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// Target path (the deleted path for deletions), normalized
    pub path: String,
    /// Source path when it differs from `path` (renames)
    pub old_path: Option<String>,
    pub is_new: bool,
    pub is_delete: bool,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn added_lines(&self) -> impl Iterator<Item = &str> {
        self.hunks.iter().flat_map(|h| {
            h.lines.iter().filter_map(|l| match l {
                HunkLine::Add(s) => Some(s.as_str()),
                _ => None,
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPatch {
    pub files: Vec<FilePatch>,
}

impl ParsedPatch {
    /// Every path the patch touches, rename sources included, deduplicated.
    pub fn paths(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for f in &self.files {
            for p in std::iter::once(&f.path).chain(f.old_path.iter()) {
                if !out.contains(p) {
                    out.push(p.clone());
                }
            }
        }
        out
    }

    /// Whether every file section is a brand-new file.
    pub fn all_new(&self) -> bool {
        !self.files.is_empty() && self.files.iter().all(|f| f.is_new)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathHeader {
    DevNull,
    Path(String),
}

fn parse_path_header(raw: &str) -> PathHeader {
    let raw = raw.split('\t').next().unwrap_or("").trim();
    let raw = raw.trim_matches('"');
    if raw == "/dev/null" {
        return PathHeader::DevNull;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    PathHeader::Path(stripped.to_string())
}

/// Target path from a `diff --git a/x b/y` line.
pub(crate) fn git_header_path(rest: &str) -> Option<String> {
    let rest = rest.trim();
    let idx = rest.rfind(" b/")?;
    let target = &rest[idx + 3..];
    (!target.is_empty()).then(|| target.to_string())
}

#[derive(Debug, Default)]
struct Section {
    start_line: usize,
    git_path: Option<String>,
    old: Option<PathHeader>,
    new: Option<PathHeader>,
    is_new: bool,
    is_delete: bool,
    hunks: Vec<Hunk>,
}

#[derive(Debug)]
struct OpenHunk {
    hunk: Hunk,
    header_line: usize,
    header: String,
    old_left: usize,
    new_left: usize,
}

#[derive(Debug, Default)]
struct Parser {
    files: Vec<FilePatch>,
    section: Option<Section>,
    hunk: Option<OpenHunk>,
}

const METADATA_PREFIXES: &[&str] = &[
    "index ",
    "similarity index",
    "dissimilarity index",
    "rename from",
    "rename to",
    "copy from",
    "copy to",
    "old mode",
    "new mode",
];

impl Parser {
    fn feed(&mut self, n: usize, line: &str) -> Result<(), PatchError> {
        if let Some(open) = self.hunk.as_mut() {
            if open.old_left > 0 || open.new_left > 0 {
                let both = open.old_left > 0 && open.new_left > 0;
                let parsed = match line.chars().next() {
                    Some(' ') if both => Some(HunkLine::Context(line[1..].to_string())),
                    None if both => Some(HunkLine::Context(String::new())),
                    Some('-') if open.old_left > 0 => Some(HunkLine::Remove(line[1..].to_string())),
                    Some('+') if open.new_left > 0 => Some(HunkLine::Add(line[1..].to_string())),
                    Some('\\') => return Ok(()),
                    _ => None,
                };
                return match parsed {
                    Some(l) => {
                        match &l {
                            HunkLine::Context(_) => {
                                open.old_left -= 1;
                                open.new_left -= 1;
                            }
                            HunkLine::Remove(_) => open.old_left -= 1,
                            HunkLine::Add(_) => open.new_left -= 1,
                        }
                        open.hunk.lines.push(l);
                        Ok(())
                    }
                    None => Err(PatchError::HunkMismatch {
                        line: open.header_line,
                        header: open.header.clone(),
                    }),
                };
            }
            if line.starts_with('\\') {
                return Ok(());
            }
            self.close_hunk();
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            self.finish_section()?;
            self.section = Some(Section {
                start_line: n,
                git_path: git_header_path(rest),
                ..Default::default()
            });
        } else if let Some(rest) = line.strip_prefix("--- ") {
            let reuse = self
                .section
                .as_ref()
                .is_some_and(|s| s.old.is_none() && s.new.is_none() && s.hunks.is_empty());
            if !reuse {
                self.finish_section()?;
                self.section = Some(Section {
                    start_line: n,
                    ..Default::default()
                });
            }
            if let Some(s) = self.section.as_mut() {
                s.old = Some(parse_path_header(rest));
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let section = self.section.get_or_insert_with(|| Section {
                start_line: n,
                ..Default::default()
            });
            section.new = Some(parse_path_header(rest));
        } else if line.starts_with("@@") {
            let Some(section) = self.section.as_ref() else {
                return Err(PatchError::StrayLine {
                    line: n,
                    content: line.to_string(),
                });
            };
            if section.new.is_none() {
                return Err(PatchError::MissingPath {
                    line: section.start_line,
                });
            }
            let caps = HUNK_HEADER_REGEX
                .captures(line)
                .ok_or_else(|| PatchError::BadHunkHeader {
                    line: n,
                    header: line.to_string(),
                })?;
            let num = |i: usize| -> Result<usize, PatchError> {
                caps[i].parse().map_err(|_| PatchError::BadHunkHeader {
                    line: n,
                    header: line.to_string(),
                })
            };
            let (old_start, old_count, new_start, new_count) = (num(1)?, num(2)?, num(3)?, num(4)?);
            self.hunk = Some(OpenHunk {
                hunk: Hunk {
                    old_start,
                    old_count,
                    new_start,
                    new_count,
                    lines: Vec::new(),
                },
                header_line: n,
                header: line.to_string(),
                old_left: old_count,
                new_left: new_count,
            });
        } else if line.starts_with("new file mode") {
            if let Some(s) = self.section.as_mut() {
                s.is_new = true;
            }
        } else if line.starts_with("deleted file mode") {
            if let Some(s) = self.section.as_mut() {
                s.is_delete = true;
            }
        } else if METADATA_PREFIXES.iter().any(|p| line.starts_with(p)) || line.trim().is_empty()
        {
            // metadata and separators carry nothing we apply
        } else if self.section.is_some() || !self.files.is_empty() {
            return Err(PatchError::StrayLine {
                line: n,
                content: line.to_string(),
            });
        }
        Ok(())
    }

    fn close_hunk(&mut self) {
        if let Some(open) = self.hunk.take()
            && let Some(section) = self.section.as_mut()
        {
            section.hunks.push(open.hunk);
        }
    }

    fn finish_section(&mut self) -> Result<(), PatchError> {
        self.close_hunk();
        let Some(s) = self.section.take() else {
            return Ok(());
        };

        let mut is_new = s.is_new || matches!(s.old, Some(PathHeader::DevNull));
        let is_delete = s.is_delete || matches!(s.new, Some(PathHeader::DevNull));
        let old_path = match &s.old {
            Some(PathHeader::Path(p)) => Some(p.clone()),
            _ => None,
        };
        let new_path = match &s.new {
            Some(PathHeader::Path(p)) => Some(p.clone()),
            _ => None,
        };

        let target = if is_delete {
            old_path.clone().or_else(|| s.git_path.clone())
        } else {
            new_path.or_else(|| s.git_path.clone())
        };
        let Some(target) = target else {
            return Err(PatchError::MissingPath { line: s.start_line });
        };
        let path = normalize_path(&target).ok_or(PatchError::UnsafePath {
            path: target.clone(),
        })?;

        if s.hunks.is_empty() {
            if is_new {
                return Err(PatchError::EmptyNewFile { path });
            }
            // Renames, copies and mode changes are only accepted with content.
            return Err(PatchError::NoHunks { path });
        }

        let old_path = match old_path.filter(|_| !is_delete) {
            Some(old) => {
                let norm = normalize_path(&old).ok_or(PatchError::UnsafePath { path: old.clone() })?;
                (norm != path).then_some(norm)
            }
            None => None,
        };
        if is_delete {
            is_new = false;
        }

        self.files.push(FilePatch {
            path,
            old_path,
            is_new,
            is_delete,
            hunks: s.hunks,
        });
        Ok(())
    }

    fn finish(mut self) -> Result<ParsedPatch, PatchError> {
        if let Some(open) = &self.hunk
            && (open.old_left > 0 || open.new_left > 0)
        {
            return Err(PatchError::Truncated(format!(
                "hunk at line {} ends early ({} old and {} new lines missing)",
                open.header_line, open.old_left, open.new_left
            )));
        }
        self.finish_section()?;

        if self.files.is_empty() {
            return Err(PatchError::Empty);
        }

        if let Some(last) = self.files.last() {
            let quotes: usize = last.added_lines().map(|l| l.matches("\"\"\"").count()).sum();
            if quotes % 2 == 1 {
                return Err(PatchError::Truncated(format!(
                    "unterminated triple-quoted block in {}",
                    last.path
                )));
            }
        }

        Ok(ParsedPatch { files: self.files })
    }
}

/// Parse a unified diff, rejecting structural defects and truncation signals.
pub fn parse(text: &str) -> Result<ParsedPatch, PatchError> {
    if text.trim().is_empty() {
        return Err(PatchError::Empty);
    }

    let fences = text.lines().filter(|l| l.starts_with("```")).count();
    if fences % 2 == 1 {
        return Err(PatchError::Truncated("unterminated ``` fence".to_string()));
    }

    let mut parser = Parser::default();
    for (i, line) in text.lines().enumerate() {
        if line.starts_with("```") {
            continue;
        }
        parser.feed(i + 1, line)?;
    }
    parser.finish()
}
