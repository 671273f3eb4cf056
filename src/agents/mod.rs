//! Seams to the external collaborators.
//!
//! The executor only talks to these traits. `command` holds the shipped
//! implementations, which speak JSON over stdio to a configured command.

pub mod command;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::doctor::{Feedback, Verdict};
use crate::errors::ProviderError;
use crate::plan::Complexity;

pub use command::{CommandAuditor, CommandBuilder, CommandDoctor, NoopAuditor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// Return the JSON list of paths the patch will touch.
    Manifest,
    /// Return a unified diff touching exactly the approved manifest.
    Patch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub mode: BuildMode,
    pub run_id: String,
    pub phase_id: String,
    pub phase_name: String,
    pub description: String,
    pub category: String,
    pub complexity: Complexity,
    pub deliverables: Vec<String>,
    pub allowed_roots: Vec<String>,
    pub protected: Vec<String>,
    pub token_budget: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_manifest: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor_guidance: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_providers: Vec<String>,
}

/// Error block a provider may include in its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub message: String,
    #[serde(default)]
    pub transient: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub error: Option<ProviderFailure>,
}

impl BuildResponse {
    pub fn provider_name(&self) -> &str {
        self.provider.as_deref().unwrap_or("builder")
    }

    /// Turn a reported failure into a provider error.
    pub fn into_result(self) -> Result<Self, ProviderError> {
        let provider = self.provider_name().to_string();
        match &self.error {
            Some(failure) if failure.transient => Err(ProviderError::Transient {
                provider,
                message: failure.message.clone(),
            }),
            Some(failure) => Err(ProviderError::Rejected {
                provider,
                message: failure.message.clone(),
            }),
            None if !self.success => Err(ProviderError::Rejected {
                provider,
                message: "provider reported failure without details".to_string(),
            }),
            None => Ok(self),
        }
    }
}

#[async_trait]
pub trait Builder: Send + Sync {
    async fn generate(&self, request: &BuildRequest) -> Result<BuildResponse, ProviderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRequest {
    pub run_id: String,
    pub phase_id: String,
    pub changed_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_focus: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResponse {
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Checks applied changes. Must not modify the working tree.
#[async_trait]
pub trait Auditor: Send + Sync {
    async fn audit(&self, request: &AuditRequest) -> Result<AuditResponse, ProviderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorRequest {
    pub run_id: String,
    pub phase_id: String,
    pub phase_name: String,
    pub description: String,
    pub deliverables: Vec<String>,
    pub retry_attempt: u32,
    pub failure_history: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
}

/// External re-planning.
#[async_trait]
pub trait Doctor: Send + Sync {
    async fn diagnose(&self, request: &DoctorRequest) -> Result<Verdict, ProviderError>;
}
