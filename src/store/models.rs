use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::plan::Complexity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    Queued,
    Executing,
    Complete,
    Failed,
    Blocked,
    NeedsReview,
}

impl PhaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Executing => "EXECUTING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
            Self::NeedsReview => "NEEDS_REVIEW",
        }
    }

    /// No further execution without operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Blocked | Self::NeedsReview)
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "EXECUTING" => Ok(Self::Executing),
            "COMPLETE" => Ok(Self::Complete),
            "FAILED" => Ok(Self::Failed),
            "BLOCKED" => Ok(Self::Blocked),
            "NEEDS_REVIEW" => Ok(Self::NeedsReview),
            _ => Err(format!("Invalid phase state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Queued,
    Running,
    Paused,
    DoneSuccess,
    DoneNeedsReview,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::DoneSuccess => "DONE_SUCCESS",
            Self::DoneNeedsReview => "DONE_NEEDS_REVIEW",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DoneSuccess | Self::DoneNeedsReview)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "DONE_SUCCESS" => Ok(Self::DoneSuccess),
            "DONE_NEEDS_REVIEW" => Ok(Self::DoneNeedsReview),
            _ => Err(format!("Invalid run state: {}", s)),
        }
    }
}

/// Classified reason an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PatchMalformed,
    DeliverablesMismatch,
    ScopeViolation,
    TokenTruncated,
    TestFailed,
    TransientProviderError,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatchMalformed => "patch_malformed",
            Self::DeliverablesMismatch => "deliverables_mismatch",
            Self::ScopeViolation => "scope_violation",
            Self::TokenTruncated => "token_truncated",
            Self::TestFailed => "test_failed",
            Self::TransientProviderError => "transient_provider_error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patch_malformed" => Ok(Self::PatchMalformed),
            "deliverables_mismatch" => Ok(Self::DeliverablesMismatch),
            "scope_violation" => Ok(Self::ScopeViolation),
            "token_truncated" => Ok(Self::TokenTruncated),
            "test_failed" => Ok(Self::TestFailed),
            "transient_provider_error" => Ok(Self::TransientProviderError),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid failure kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub state: RunState,
    pub plan_hash: String,
    pub plan_name: Option<String>,
    pub token_cap: Option<u64>,
    pub max_phases: u32,
    pub tokens_used: u64,
    pub doctor_invocations: u32,
    pub disabled_providers: Vec<String>,
    pub stop_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierRecord {
    pub run_id: String,
    pub tier_index: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRecord {
    pub run_id: String,
    pub phase_id: String,
    pub tier_index: u32,
    pub phase_index: u32,
    pub name: String,
    pub description: String,
    pub deliverables: Vec<String>,
    pub scope: Vec<String>,
    pub category: String,
    pub complexity: Complexity,
    pub state: PhaseState,
    pub retry_attempt: u32,
    pub last_failure_reason: Option<String>,
    pub token_budget: Option<u32>,
    pub doctor_invocations: u32,
    pub doctor_guidance: Option<String>,
    pub updated_at: String,
}

/// One execution of a phase, kept for the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub run_id: String,
    pub phase_id: String,
    pub attempt: u32,
    pub budget: u32,
    pub predicted: u32,
    pub actual_tokens: u64,
    pub stop_reason: Option<String>,
    pub escalations: u32,
    pub patch_path: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub feedback: Option<String>,
}

/// Prediction vs. actual, written once per terminal outcome per phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenEstimation {
    pub run_id: String,
    pub phase_id: String,
    pub outcome: String,
    pub predicted: u32,
    pub actual: u64,
    pub budget: u32,
    pub category: String,
    pub complexity: Complexity,
    pub deliverable_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub requeued: Vec<String>,
    pub needs_review: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run: RunRecord,
    pub tiers: Vec<TierRecord>,
    pub phases: Vec<PhaseRecord>,
}

impl RunSummary {
    pub fn count(&self, state: PhaseState) -> usize {
        self.phases.iter().filter(|p| p.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_state_roundtrip_and_terminal() {
        for state in [
            PhaseState::Queued,
            PhaseState::Executing,
            PhaseState::Complete,
            PhaseState::Failed,
            PhaseState::Blocked,
            PhaseState::NeedsReview,
        ] {
            assert_eq!(state.as_str().parse::<PhaseState>().unwrap(), state);
        }
        assert!(PhaseState::NeedsReview.is_terminal());
        assert!(!PhaseState::Failed.is_terminal());
        assert!("DONE".parse::<PhaseState>().is_err());
    }

    #[test]
    fn test_run_state_terminal() {
        assert!(RunState::DoneSuccess.is_terminal());
        assert!(RunState::DoneNeedsReview.is_terminal());
        assert!(!RunState::Paused.is_terminal());
        assert_eq!("PAUSED".parse::<RunState>().unwrap(), RunState::Paused);
    }

    #[test]
    fn test_failure_kind_serde_matches_as_str() {
        let json = serde_json::to_string(&FailureKind::TransientProviderError).unwrap();
        assert_eq!(json, "\"transient_provider_error\"");
        assert_eq!(
            "scope_violation".parse::<FailureKind>().unwrap(),
            FailureKind::ScopeViolation
        );
    }
}
