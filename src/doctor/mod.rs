//! Failure classification and recovery policy.
//!
//! Every failed attempt is reduced to a [`FailureKind`], then the policy
//! picks a recovery [`Action`]. Outcomes are plain tagged values; nothing
//! here touches the store or the working tree.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::anvil_config::AnvilToml;
use crate::errors::ProviderError;
use crate::manifest::ManifestFeedback;
use crate::patch::{PatchRejection, RejectionKind};

pub use crate::store::FailureKind;

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    RetryableFailure(FailureKind),
    ExhaustedFailure(FailureKind),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryableFailure(kind) => write!(f, "retryable:{}", kind),
            Self::ExhaustedFailure(kind) => write!(f, "exhausted:{}", kind),
        }
    }
}

/// Re-planning decision returned by the external Doctor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Retry with new guidance fed into the next Builder request.
    Revise { guidance: String },
    /// Stop this phase until an operator intervenes.
    Block { reason: String },
    /// Hand the phase to a human.
    GiveUp { reason: String },
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Revise { .. } => write!(f, "REVISE"),
            Self::Block { .. } => write!(f, "BLOCK"),
            Self::GiveUp { .. } => write!(f, "GIVE_UP"),
        }
    }
}

/// What the loop should do next after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Let the auto-reset sweep requeue the phase; feedback rides along.
    RetryWithFeedback,
    /// Wait, then retry. Optionally disable the provider for the run.
    Backoff {
        delay: Duration,
        disable_provider: bool,
    },
    /// Ask the Doctor for a verdict.
    ConsultDoctor,
    /// Out of retries; the sweep parks the phase in NEEDS_REVIEW.
    NeedsReview,
}

/// Structured feedback stored with an attempt and fed to the next request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub kind: Option<FailureKind>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offending_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ManifestFeedback>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl Feedback {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn from_rejection(rejection: &PatchRejection) -> Self {
        Self {
            offending_paths: rejection.offending_paths.clone(),
            ..Self::new(classify_rejection(rejection), rejection.message.clone())
        }
    }

    pub fn from_manifest(feedback: &ManifestFeedback) -> Self {
        Self {
            manifest: Some(feedback.clone()),
            ..Self::new(FailureKind::DeliverablesMismatch, feedback.summary())
        }
    }

    pub fn from_provider(error: &ProviderError) -> Self {
        Self::new(classify_provider(error), error.to_string())
    }

    pub fn tests_failed(issues: Vec<String>) -> Self {
        Self {
            issues,
            ..Self::new(FailureKind::TestFailed, "tests failed")
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }

    /// Parse stored feedback; plain text from older attempts becomes the message.
    pub fn from_stored(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self {
            message: raw.to_string(),
            ..Default::default()
        })
    }

    /// One line for `last_failure_reason`.
    pub fn reason(&self) -> String {
        if self.offending_paths.is_empty() {
            self.message.clone()
        } else {
            format!("{} [{}]", self.message, self.offending_paths.join(", "))
        }
    }
}

pub fn classify_rejection(rejection: &PatchRejection) -> FailureKind {
    match rejection.kind {
        RejectionKind::ScopeViolation => FailureKind::ScopeViolation,
        RejectionKind::Malformed | RejectionKind::ApplyFailed => FailureKind::PatchMalformed,
    }
}

pub fn classify_provider(error: &ProviderError) -> FailureKind {
    if error.is_transient() {
        FailureKind::TransientProviderError
    } else {
        FailureKind::Unknown
    }
}

/// Stop reasons that mean the generation hit its output limit.
pub fn is_truncation(stop_reason: Option<&str>) -> bool {
    matches!(
        stop_reason.map(|s| s.to_ascii_lowercase()).as_deref(),
        Some("max_tokens" | "length" | "max_output_tokens")
    )
}

/// Inputs the policy needs besides the failure class.
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    /// retry_attempt after this failure was recorded
    pub retry_attempt: u32,
    pub has_hints: bool,
    pub doctor_available: bool,
    pub run_doctor_invocations: u32,
    pub phase_doctor_invocations: u32,
    /// Consecutive transient failures from the provider that just failed
    pub consecutive_transient: u32,
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub max_retry_attempts: u32,
    pub doctor_after_retries: u32,
    pub doctor_run_cap: u32,
    pub doctor_phase_cap: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub disable_provider_after: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self::from_config(&AnvilToml::default())
    }
}

impl Policy {
    pub fn from_config(toml: &AnvilToml) -> Self {
        Self {
            max_retry_attempts: toml.execution.max_retry_attempts,
            doctor_after_retries: toml.doctor.after_retries,
            doctor_run_cap: toml.doctor.run_cap,
            doctor_phase_cap: toml.doctor.phase_cap,
            backoff_base: Duration::from_millis(toml.execution.backoff_base_ms),
            backoff_max: Duration::from_millis(toml.execution.backoff_max_ms),
            disable_provider_after: toml.execution.disable_provider_after,
        }
    }

    pub fn outcome(&self, kind: FailureKind, retry_attempt: u32) -> Outcome {
        if retry_attempt >= self.max_retry_attempts {
            Outcome::ExhaustedFailure(kind)
        } else {
            Outcome::RetryableFailure(kind)
        }
    }

    /// Retries before the Doctor is consulted. Matching hints buy one more
    /// attempt first.
    pub fn doctor_threshold(&self, has_hints: bool) -> u32 {
        self.doctor_after_retries + u32::from(has_hints)
    }

    pub fn should_consult_doctor(&self, ctx: &FailureContext) -> bool {
        ctx.doctor_available
            && ctx.retry_attempt >= self.doctor_threshold(ctx.has_hints)
            && ctx.run_doctor_invocations < self.doctor_run_cap
            && ctx.phase_doctor_invocations < self.doctor_phase_cap
    }

    /// Exponential backoff: base × 2^(n-1), capped.
    pub fn backoff(&self, consecutive: u32) -> Duration {
        let exp = consecutive.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }

    pub fn action(&self, kind: FailureKind, ctx: &FailureContext) -> Action {
        if let Outcome::ExhaustedFailure(_) = self.outcome(kind, ctx.retry_attempt) {
            return Action::NeedsReview;
        }
        match kind {
            FailureKind::TransientProviderError => Action::Backoff {
                delay: self.backoff(ctx.consecutive_transient),
                disable_provider: ctx.consecutive_transient >= self.disable_provider_after,
            },
            FailureKind::TestFailed if self.should_consult_doctor(ctx) => Action::ConsultDoctor,
            _ => Action::RetryWithFeedback,
        }
    }
}
