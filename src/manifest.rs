//! Deliverables manifest gate.
//!
//! The Builder first commits to the exact set of paths it will write. The
//! manifest is checked against the required deliverables and the phase
//! scope before any content is generated, and the eventual patch must
//! touch exactly that set.

use serde::{Deserialize, Serialize};

use crate::patch::Governance;
use crate::patch::scope::{is_protected, normalize_path, root_contains};

/// Structured mismatch report fed back to the Builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFeedback {
    pub expected: Vec<String>,
    pub actual: Vec<String>,
    pub missing: Vec<String>,
    pub extra: Vec<String>,
    pub forbidden: Vec<String>,
}

impl ManifestFeedback {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.forbidden.is_empty()
    }

    /// One-line description for logs and failure reasons.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing [{}]", self.missing.join(", ")));
        }
        if !self.extra.is_empty() {
            parts.push(format!("extra [{}]", self.extra.join(", ")));
        }
        if !self.forbidden.is_empty() {
            parts.push(format!("forbidden [{}]", self.forbidden.join(", ")));
        }
        parts.join("; ")
    }
}

/// Entry covers path: equal, or a directory entry that is a prefix.
fn covers(entry: &str, path: &str) -> bool {
    if entry.ends_with('/') {
        path.starts_with(entry)
    } else {
        entry == path
    }
}

/// Extract the path list from a Builder's manifest response.
///
/// Accepts a JSON array of strings or an object with a `files` array,
/// optionally wrapped in a ``` fence.
pub fn parse_manifest(content: &str) -> Result<Vec<String>, String> {
    let body: String = content
        .lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");

    let value: serde_json::Value =
        serde_json::from_str(body.trim()).map_err(|e| format!("manifest is not valid JSON: {}", e))?;

    let list = match &value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => match map.get("files") {
            Some(serde_json::Value::Array(items)) => items,
            _ => return Err("manifest object has no 'files' array".to_string()),
        },
        _ => return Err("manifest must be a JSON list of paths".to_string()),
    };

    list.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("manifest entry is not a string: {}", v))
        })
        .collect()
}

/// An approved manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    entries: Vec<String>,
}

impl Manifest {
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Validate a proposed manifest before content generation.
    pub fn validate(
        raw: &[String],
        required: &[String],
        governance: &Governance,
    ) -> Result<Self, ManifestFeedback> {
        let mut entries: Vec<String> = Vec::new();
        let mut forbidden = Vec::new();

        for item in raw {
            match normalize_path(item) {
                None => forbidden.push(item.clone()),
                Some(path) => {
                    if is_protected(&path, &governance.protected)
                        || !governance
                            .allowed_roots
                            .iter()
                            .any(|r| root_contains(r, &path))
                    {
                        if !forbidden.contains(&path) {
                            forbidden.push(path);
                        }
                    } else if !entries.contains(&path) {
                        entries.push(path);
                    }
                }
            }
        }

        let required: Vec<String> = required.iter().filter_map(|d| normalize_path(d)).collect();
        let missing: Vec<String> = required
            .iter()
            .filter(|d| {
                !entries.iter().any(|e| {
                    covers(e, d) || (d.ends_with('/') && e.starts_with(d.as_str()))
                })
            })
            .cloned()
            .collect();

        let feedback = ManifestFeedback {
            expected: required,
            actual: entries.clone(),
            missing,
            extra: Vec::new(),
            forbidden,
        };
        if entries.is_empty() || !feedback.is_clean() {
            return Err(feedback);
        }
        entries.sort();
        Ok(Self { entries })
    }

    /// Compare the patch's touched paths against the approved set. Paths the
    /// phase scope does not allow are also listed as `forbidden`.
    pub fn check_patch(
        &self,
        paths: &[String],
        governance: &Governance,
    ) -> Result<(), ManifestFeedback> {
        let extra: Vec<String> = paths
            .iter()
            .filter(|p| !self.entries.iter().any(|e| covers(e, p)))
            .cloned()
            .collect();
        let missing: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !paths.iter().any(|p| covers(e, p)))
            .cloned()
            .collect();
        let forbidden: Vec<String> = paths
            .iter()
            .filter(|p| {
                is_protected(p, &governance.protected)
                    || !governance
                        .allowed_roots
                        .iter()
                        .any(|r| root_contains(r, p))
            })
            .cloned()
            .collect();

        let feedback = ManifestFeedback {
            expected: self.entries.clone(),
            actual: paths.to_vec(),
            missing,
            extra,
            forbidden,
        };
        if feedback.is_clean() {
            return Ok(());
        }
        Err(feedback)
    }
}
