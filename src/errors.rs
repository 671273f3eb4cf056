//! Typed error hierarchy for the anvil orchestrator.
//!
//! One enum per subsystem:
//! - `StartupError`: fatal errors that abort a run before any phase executes
//! - `StoreError`: durable phase store failures
//! - `LeaseError`: lease coordinator failures
//! - `PatchError`: structural defects found while parsing a patch
//! - `ProviderError`: transport failures talking to Builder/Auditor/Doctor

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors surfaced before the executor loop starts.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Durable store unreachable at {path}: {source}")]
    StoreUnreachable {
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("Lease unavailable: {0}")]
    LeaseUnavailable(#[from] LeaseError),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the durable phase store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Phase {phase_id} not found in run {run_id}")]
    PhaseNotFound { run_id: String, phase_id: String },

    #[error("Invalid transition for phase {phase_id}: {from} -> {to}")]
    InvalidTransition {
        phase_id: String,
        from: String,
        to: String,
    },

    #[error("Corrupt value in column {column}: {value}")]
    CorruptValue { column: String, value: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store task failed: {0}")]
    TaskFailed(String),
}

/// Errors from the lease coordinator.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("Lease on {path} held by {owner} (timed out after {waited_ms}ms)")]
    Timeout {
        path: PathBuf,
        owner: String,
        waited_ms: u64,
    },

    #[error("Lease on {path} is no longer owned by {owner_token}")]
    NotOwner { path: PathBuf, owner_token: String },

    #[error("Lease I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Structural defects found while parsing a unified diff.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("Patch is empty")]
    Empty,

    #[error("Unparseable hunk header at line {line}: {header}")]
    BadHunkHeader { line: usize, header: String },

    #[error("Hunk at line {line} does not match its body: {header}")]
    HunkMismatch { line: usize, header: String },

    #[error("Patch appears truncated: {0}")]
    Truncated(String),

    #[error("New file {path} has a header but no hunk body")]
    EmptyNewFile { path: String },

    #[error("File section for {path} has no hunks; renames, copies and mode changes need a content diff")]
    NoHunks { path: String },

    #[error("File section at line {line} has no target path")]
    MissingPath { line: usize },

    #[error("Unsafe path in patch: {path}")]
    UnsafePath { path: String },

    #[error("Unexpected line {line} outside of any hunk: {content}")]
    StrayLine { line: usize, content: String },
}

impl PatchError {
    /// Whether the defect is one the repair step knows how to rewrite.
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            PatchError::BadHunkHeader { .. } | PatchError::MissingPath { .. }
        )
    }
}

/// Transport failures for external collaborators.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("{command} exited with code {code}: {stderr}")]
    NonZeroExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Malformed response from {command}: {message}")]
    MalformedResponse { command: String, message: String },

    #[error("Provider {provider} reported a transient error: {message}")]
    Transient { provider: String, message: String },

    #[error("Provider {provider} failed: {message}")]
    Rejected { provider: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether this failure should be classified as `transient_provider_error`.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::SpawnFailed { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::Transient { .. }
        ) || matches!(self, ProviderError::NonZeroExit { code, .. } if *code == EX_TEMPFAIL)
    }
}

/// sysexits.h `EX_TEMPFAIL`: providers use it to signal a retryable failure.
pub const EX_TEMPFAIL: i32 = 75;
