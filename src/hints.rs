//! Learned hints, read-only.
//!
//! `.anvil/hints.json` (or `.yaml`) holds short notes from earlier runs:
//!
//! ```json
//! [{"category": "test", "scope": "tests/**", "hint": "use the fixtures in conftest.py"}]
//! ```
//!
//! A hint applies when its category matches the phase (or is `*`) and its
//! scope glob matches one of the phase's deliverables or scope roots.

use std::path::Path;

use anyhow::{Context, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};

fn any_category() -> String {
    "*".to_string()
}

fn any_scope() -> String {
    "**".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnedHint {
    #[serde(default = "any_category")]
    pub category: String,
    #[serde(default = "any_scope")]
    pub scope: String,
    pub hint: String,
}

impl LearnedHint {
    pub fn matches(&self, category: &str, paths: &[String]) -> bool {
        let category_ok = self.category == "*" || self.category.eq_ignore_ascii_case(category);
        if !category_ok {
            return false;
        }
        let Ok(pattern) = Pattern::new(&self.scope) else {
            return false;
        };
        paths.iter().any(|p| {
            pattern.matches(p) || pattern.matches(p.trim_end_matches('/'))
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct HintStore {
    hints: Vec<LearnedHint>,
}

impl HintStore {
    pub fn new(hints: Vec<LearnedHint>) -> Self {
        Self { hints }
    }

    /// Load hints; a missing file means no hints.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read hints file: {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
        let hints: Vec<LearnedHint> = if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse hints YAML: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse hints JSON: {}", path.display()))?
        };

        for hint in &hints {
            if Pattern::new(&hint.scope).is_err() {
                tracing::warn!(scope = %hint.scope, "ignoring hint with invalid scope glob");
            }
        }
        Ok(Self { hints })
    }

    pub fn len(&self) -> usize {
        self.hints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }

    /// Hint texts applicable to a phase.
    pub fn for_phase(&self, category: &str, deliverables: &[String], scope: &[String]) -> Vec<String> {
        let paths: Vec<String> = deliverables.iter().chain(scope).cloned().collect();
        self.hints
            .iter()
            .filter(|h| h.matches(category, &paths))
            .map(|h| h.hint.clone())
            .collect()
    }
}
