//! Output-token budget planning.
//!
//! `predicted = overhead(category, complexity) + Σ marginal(file_type(d))`
//! over the declared deliverables, then `ceil(predicted × margin)` is rounded
//! up to the next step of the complexity's ladder. Truncated generations
//! escalate geometrically: next ladder step, then doubling up to the
//! configured ceiling.

use std::collections::BTreeMap;

use crate::anvil_config::BudgetSection;
use crate::plan::Complexity;

pub const SAFETY_MARGIN: f64 = 1.3;

pub const LADDER_LOW: [u32; 3] = [4096, 8192, 16384];
pub const LADDER_MEDIUM: [u32; 3] = [8192, 16384, 32768];
pub const LADDER_HIGH: [u32; 3] = [16384, 32768, 65536];

/// Directory deliverables usually expand to several files.
const DIR_DELIVERABLE_WEIGHT: u32 = 2;

/// Coarse file classification used for marginal costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileType {
    Source,
    Test,
    Doc,
    Config,
    Data,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Source => "source",
            FileType::Test => "test",
            FileType::Doc => "doc",
            FileType::Config => "config",
            FileType::Data => "data",
        }
    }

    fn default_marginal(&self) -> u32 {
        match self {
            FileType::Source => 1200,
            FileType::Test => 900,
            FileType::Doc => 500,
            FileType::Config => 200,
            FileType::Data => 300,
        }
    }
}

const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "c", "h", "cc", "cpp", "hpp", "cs",
    "rb", "php", "swift", "scala", "sh", "sql", "html", "css", "scss", "vue", "svelte",
];
const DOC_EXTENSIONS: &[&str] = &["md", "rst", "txt", "adoc"];
const CONFIG_EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "ini", "cfg", "conf", "env"];
const CONFIG_NAMES: &[&str] = &["Dockerfile", "Makefile", ".gitignore", ".editorconfig"];

/// Classify a deliverable path.
pub fn file_type_of(path: &str) -> FileType {
    let trimmed = path.trim_end_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();
    let name = segments.last().copied().unwrap_or("");
    let dirs = &segments[..segments.len().saturating_sub(1)];

    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, e.to_ascii_lowercase()),
        _ => (name, String::new()),
    };

    let in_test_dir = dirs
        .iter()
        .chain(path.ends_with('/').then_some(&name))
        .any(|d| matches!(*d, "tests" | "test" | "__tests__" | "spec"));
    if in_test_dir
        || stem.starts_with("test_")
        || stem.ends_with("_test")
        || stem.ends_with(".test")
        || stem.ends_with(".spec")
    {
        return FileType::Test;
    }

    if path.ends_with('/') {
        return if matches!(name, "docs" | "doc") {
            FileType::Doc
        } else {
            FileType::Source
        };
    }

    if DOC_EXTENSIONS.contains(&ext.as_str()) || dirs.first().is_some_and(|d| *d == "docs") {
        FileType::Doc
    } else if CONFIG_EXTENSIONS.contains(&ext.as_str()) || CONFIG_NAMES.contains(&name) {
        FileType::Config
    } else if SOURCE_EXTENSIONS.contains(&ext.as_str()) {
        FileType::Source
    } else {
        FileType::Data
    }
}

/// A planned budget for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetPlan {
    pub predicted: u32,
    pub budget: u32,
}

#[derive(Debug, Clone)]
pub struct BudgetPlanner {
    margin: f64,
    ceiling: u32,
    ladder_low: Vec<u32>,
    ladder_medium: Vec<u32>,
    ladder_high: Vec<u32>,
    category_overhead: BTreeMap<String, u32>,
    marginal: BTreeMap<String, u32>,
}

impl Default for BudgetPlanner {
    fn default() -> Self {
        Self::from_config(&BudgetSection::default())
    }
}

impl BudgetPlanner {
    pub fn from_config(section: &BudgetSection) -> Self {
        let pick = |custom: &Option<Vec<u32>>, default: &[u32]| match custom {
            Some(steps) if !steps.is_empty() => steps.clone(),
            _ => default.to_vec(),
        };
        Self {
            margin: section.safety_margin.max(1.0),
            ceiling: section.ceiling,
            ladder_low: pick(&section.ladder_low, &LADDER_LOW),
            ladder_medium: pick(&section.ladder_medium, &LADDER_MEDIUM),
            ladder_high: pick(&section.ladder_high, &LADDER_HIGH),
            category_overhead: section.category_overhead.clone(),
            marginal: section.marginal.clone(),
        }
    }

    pub fn ladder(&self, complexity: Complexity) -> &[u32] {
        match complexity {
            Complexity::Low => &self.ladder_low,
            Complexity::Medium => &self.ladder_medium,
            Complexity::High => &self.ladder_high,
        }
    }

    pub fn overhead(&self, category: &str, complexity: Complexity) -> u32 {
        let base = match complexity {
            Complexity::Low => 1000,
            Complexity::Medium => 2000,
            Complexity::High => 4000,
        };
        let category = category.to_ascii_lowercase();
        let addon = self
            .category_overhead
            .get(&category)
            .copied()
            .unwrap_or(match category.as_str() {
                "docs" | "config" => 0,
                "bugfix" | "test" => 300,
                "refactor" => 800,
                _ => 500,
            });
        base + addon
    }

    pub fn marginal_cost(&self, file_type: FileType) -> u32 {
        self.marginal
            .get(file_type.as_str())
            .copied()
            .unwrap_or_else(|| file_type.default_marginal())
    }

    pub fn predict(&self, category: &str, complexity: Complexity, deliverables: &[String]) -> u32 {
        let marginal: u32 = deliverables
            .iter()
            .map(|d| {
                let cost = self.marginal_cost(file_type_of(d));
                if d.ends_with('/') {
                    cost * DIR_DELIVERABLE_WEIGHT
                } else {
                    cost
                }
            })
            .sum();
        self.overhead(category, complexity) + marginal
    }

    /// Smallest ladder step ≥ target, or the top step.
    pub fn select(&self, complexity: Complexity, target: u32) -> u32 {
        let ladder = self.ladder(complexity);
        ladder
            .iter()
            .copied()
            .find(|step| *step >= target)
            .or_else(|| ladder.last().copied())
            .unwrap_or(target)
    }

    /// Plan a budget, never going below what the phase already has stored.
    pub fn plan(
        &self,
        category: &str,
        complexity: Complexity,
        deliverables: &[String],
        stored: Option<u32>,
    ) -> BudgetPlan {
        let predicted = self.predict(category, complexity, deliverables);
        let target = (predicted as f64 * self.margin).ceil() as u32;
        let selected = self.select(complexity, target);
        BudgetPlan {
            predicted,
            budget: selected.max(stored.unwrap_or(0)),
        }
    }

    /// Next budget after a truncation, or `None` once the ceiling is reached.
    pub fn escalate(&self, complexity: Complexity, current: u32) -> Option<u32> {
        if current >= self.ceiling {
            return None;
        }
        let next = self
            .ladder(complexity)
            .iter()
            .copied()
            .find(|step| *step > current)
            .unwrap_or_else(|| current.saturating_mul(2));
        Some(next.min(self.ceiling))
    }
}
