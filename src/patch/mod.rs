//! Governed patch pipeline.
//!
//! Agent output is untrusted. A patch goes through, in order:
//!
//! 1. structural validation ([`parser`])
//! 2. best-effort repair of known defects ([`repair`]), then re-validation
//! 3. scope enforcement against allowed roots and protected paths ([`scope`])
//! 4. all-or-nothing application ([`apply`])
//!
//! Steps 1–3 never touch the filesystem. Step 4 either writes every file or
//! restores the tree.

pub mod apply;
pub mod parser;
pub mod repair;
pub mod scope;

use serde::{Deserialize, Serialize};
use std::path::Path;

pub use apply::{ApplyOutcome, FileChange};
pub use parser::ParsedPatch;
pub use repair::Repair;

/// Why the pipeline refused a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Malformed,
    ScopeViolation,
    ApplyFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRejection {
    pub kind: RejectionKind,
    pub message: String,
    pub offending_paths: Vec<String>,
}

impl std::fmt::Display for PatchRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.offending_paths.is_empty() {
            write!(f, " [{}]", self.offending_paths.join(", "))?;
        }
        Ok(())
    }
}

/// A structurally valid patch, possibly repaired.
#[derive(Debug, Clone)]
pub struct PreparedPatch {
    pub parsed: ParsedPatch,
    pub repairs: Vec<Repair>,
}

impl PreparedPatch {
    pub fn paths(&self) -> Vec<String> {
        self.parsed.paths()
    }
}

/// Successful pipeline output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub changed_files: Vec<String>,
    pub repairs: Vec<String>,
    pub direct_write: bool,
    pub undo: Vec<FileChange>,
}

/// Where a patch may write.
#[derive(Debug, Clone)]
pub struct Governance {
    pub allowed_roots: Vec<String>,
    pub protected: Vec<String>,
}

/// Steps 1 and 2: validate, repairing once if the defect is a known one.
pub fn prepare(text: &str) -> Result<PreparedPatch, PatchRejection> {
    let malformed = |e: &crate::errors::PatchError| PatchRejection {
        kind: RejectionKind::Malformed,
        message: e.to_string(),
        offending_paths: Vec::new(),
    };

    match parser::parse(text) {
        Ok(parsed) => Ok(PreparedPatch {
            parsed,
            repairs: Vec::new(),
        }),
        Err(first) if first.is_repairable() => {
            let Some((fixed, repairs)) = repair::repair(text) else {
                return Err(malformed(&first));
            };
            match parser::parse(&fixed) {
                Ok(parsed) => {
                    tracing::info!(repairs = repairs.len(), "patch repaired");
                    Ok(PreparedPatch { parsed, repairs })
                }
                Err(second) => Err(malformed(&second)),
            }
        }
        Err(e) => Err(malformed(&e)),
    }
}

/// Step 3.
pub fn enforce_scope(patch: &PreparedPatch, governance: &Governance) -> Result<(), PatchRejection> {
    let paths = patch.paths();
    let offenses = scope::check_scope(
        paths.iter().map(String::as_str),
        &governance.allowed_roots,
        &governance.protected,
    );
    if offenses.is_empty() {
        return Ok(());
    }
    Err(PatchRejection {
        kind: RejectionKind::ScopeViolation,
        message: format!(
            "patch touches paths outside its scope: {}",
            offenses
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        offending_paths: offenses.into_iter().map(|o| o.path).collect(),
    })
}

/// Step 4. Callers must hold the workspace lease.
pub fn apply(root: &Path, patch: &PreparedPatch) -> Result<Applied, PatchRejection> {
    let ApplyOutcome {
        changed_files,
        direct_write,
        undo,
    } = apply::apply_patch(root, &patch.parsed).map_err(|e| PatchRejection {
        kind: RejectionKind::ApplyFailed,
        offending_paths: vec![e.path().to_string()],
        message: e.to_string(),
    })?;

    Ok(Applied {
        changed_files,
        repairs: patch.repairs.iter().map(ToString::to_string).collect(),
        direct_write,
        undo,
    })
}

/// Restore the files an [`Applied`] patch changed. Callers must hold the
/// workspace lease.
pub fn revert(root: &Path, applied: &Applied) -> Result<(), apply::ApplyError> {
    apply::write_changes(root, &applied.undo)
}

/// Run the whole pipeline.
pub fn run(root: &Path, text: &str, governance: &Governance) -> Result<Applied, PatchRejection> {
    let prepared = prepare(text)?;
    enforce_scope(&prepared, governance)?;
    apply(root, &prepared)
}
