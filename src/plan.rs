//! Plan definition and loading.
//!
//! A plan is an ordered list of tiers, each holding phases with the
//! deliverables they must produce. Plans are authored as JSON or YAML:
//!
//! ```yaml
//! name: todo-service
//! tiers:
//!   - name: foundation
//!     phases:
//!       - id: models
//!         name: Data models
//!         category: feature
//!         complexity: low
//!         deliverables: [src/models.rs, tests/models_test.rs]
//!   - name: api
//!     phases:
//!       - id: handlers
//!         name: HTTP handlers
//!         complexity: medium
//!         deliverables: [src/handlers/]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

use crate::patch::scope::{is_protected, normalize_path};

/// Complexity class of a phase; selects the budget ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Complexity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Complexity::Low),
            "medium" => Ok(Complexity::Medium),
            "high" => Ok(Complexity::High),
            _ => anyhow::bail!(
                "Invalid complexity '{}'. Valid values: low, medium, high",
                s
            ),
        }
    }
}

fn default_category() -> String {
    "feature".to_string()
}

/// One phase as written in the plan file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Required paths; entries ending in `/` are directory prefixes
    pub deliverables: Vec<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub complexity: Complexity,
    /// Explicit allowed roots; derived from deliverables when empty
    #[serde(default)]
    pub scope: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierSpec {
    pub name: String,
    pub phases: Vec<PhaseSpec>,
}

/// The full plan file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    #[serde(default)]
    pub name: Option<String>,
    pub tiers: Vec<TierSpec>,
}

impl Plan {
    /// Load a plan, choosing YAML for `.yaml`/`.yml` files and JSON otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

        if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse plan YAML: {}", path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse plan JSON: {}", path.display()))
        }
    }

    /// Content hash, stable across JSON/YAML formatting differences.
    pub fn hash(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self).context("Failed to serialize plan")?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    pub fn phase_count(&self) -> usize {
        self.tiers.iter().map(|t| t.phases.len()).sum()
    }

    pub fn phases(&self) -> impl Iterator<Item = &PhaseSpec> {
        self.tiers.iter().flat_map(|t| t.phases.iter())
    }

    /// Return every structural problem with the plan; empty means valid.
    pub fn problems(&self, max_phases: u32, protected: &[String]) -> Vec<String> {
        let mut problems = Vec::new();

        if self.tiers.is_empty() {
            problems.push("plan has no tiers".to_string());
        }

        let count = self.phase_count();
        if count > max_phases as usize {
            problems.push(format!(
                "plan has {} phases, exceeding max_phases {}",
                count, max_phases
            ));
        }

        let mut seen = HashSet::new();
        for tier in &self.tiers {
            if tier.phases.is_empty() {
                problems.push(format!("tier '{}' has no phases", tier.name));
            }
            for phase in &tier.phases {
                if phase.id.trim().is_empty() {
                    problems.push(format!("tier '{}' has a phase with an empty id", tier.name));
                    continue;
                }
                if !seen.insert(phase.id.as_str()) {
                    problems.push(format!("duplicate phase id '{}'", phase.id));
                }
                if phase.deliverables.is_empty() {
                    problems.push(format!("phase '{}' declares no deliverables", phase.id));
                }
                for path in phase.deliverables.iter().chain(phase.scope.iter()) {
                    match normalize_path(path) {
                        None => problems.push(format!(
                            "phase '{}' path '{}' must be relative and free of '..'",
                            phase.id, path
                        )),
                        Some(norm) if is_protected(&norm, protected) => problems.push(format!(
                            "phase '{}' path '{}' is inside a protected path",
                            phase.id, path
                        )),
                        Some(_) => {}
                    }
                }
            }
        }

        problems
    }
}
