//! Command-backed collaborators.
//!
//! Each spawns `sh -c <command>` in the project directory, writes the
//! request as JSON to stdin, and reads the response from stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{
    AuditRequest, AuditResponse, Auditor, BuildRequest, BuildResponse, Builder, Doctor,
    DoctorRequest,
};
use crate::doctor::Verdict;
use crate::errors::ProviderError;

/// Lines of failing test output kept as audit issues.
const MAX_ISSUE_LINES: usize = 40;

struct Invocation<'a> {
    command: &'a str,
    project_dir: &'a Path,
    timeout: Duration,
    env: Vec<(&'static str, String)>,
}

impl Invocation<'_> {
    async fn run(&self, stdin_payload: Option<&[u8]>) -> Result<std::process::Output, ProviderError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(self.command)
            .current_dir(self.project_dir)
            .stdin(if stdin_payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| ProviderError::SpawnFailed {
            command: self.command.to_string(),
            source,
        })?;

        if let (Some(payload), Some(mut stdin)) = (stdin_payload, child.stdin.take()) {
            match stdin.write_all(payload).await {
                Ok(()) => {}
                // The command may exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(source) => {
                    return Err(ProviderError::SpawnFailed {
                        command: self.command.to_string(),
                        source,
                    });
                }
            }
        }

        match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(ProviderError::SpawnFailed {
                command: self.command.to_string(),
                source,
            }),
            Err(_) => Err(ProviderError::Timeout {
                command: self.command.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    /// Run with a JSON request and parse a JSON response from stdout.
    async fn call_json<Req, Resp>(&self, request: &Req) -> Result<Resp, ProviderError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload =
            serde_json::to_vec(request).map_err(|e| ProviderError::MalformedResponse {
                command: self.command.to_string(),
                message: format!("failed to encode request: {}", e),
            })?;

        let output = self.run(Some(&payload)).await?;
        if !output.status.success() {
            return Err(ProviderError::NonZeroExit {
                command: self.command.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: tail(&String::from_utf8_lossy(&output.stderr), 20),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim()).map_err(|e| ProviderError::MalformedResponse {
            command: self.command.to_string(),
            message: e.to_string(),
        })
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Builder that delegates to an external command.
pub struct CommandBuilder {
    command: String,
    project_dir: PathBuf,
    timeout: Duration,
}

impl CommandBuilder {
    pub fn new(command: impl Into<String>, project_dir: impl AsRef<Path>, timeout_secs: u64) -> Self {
        Self {
            command: command.into(),
            project_dir: project_dir.as_ref().to_path_buf(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    async fn generate(&self, request: &BuildRequest) -> Result<BuildResponse, ProviderError> {
        tracing::debug!(
            phase_id = %request.phase_id,
            mode = ?request.mode,
            budget = request.token_budget,
            "invoking builder"
        );
        let invocation = Invocation {
            command: &self.command,
            project_dir: &self.project_dir,
            timeout: self.timeout,
            env: vec![
                ("ANVIL_RUN_ID", request.run_id.clone()),
                ("ANVIL_PHASE_ID", request.phase_id.clone()),
                ("ANVIL_TOKEN_BUDGET", request.token_budget.to_string()),
            ],
        };
        let response: BuildResponse = invocation.call_json(request).await?;
        response.into_result()
    }
}

/// Runs the configured test command; a zero exit passes.
pub struct CommandAuditor {
    command: String,
    project_dir: PathBuf,
    timeout: Duration,
}

impl CommandAuditor {
    pub fn new(command: impl Into<String>, project_dir: impl AsRef<Path>, timeout_secs: u64) -> Self {
        Self {
            command: command.into(),
            project_dir: project_dir.as_ref().to_path_buf(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl Auditor for CommandAuditor {
    async fn audit(&self, request: &AuditRequest) -> Result<AuditResponse, ProviderError> {
        let invocation = Invocation {
            command: &self.command,
            project_dir: &self.project_dir,
            timeout: self.timeout,
            env: vec![
                ("ANVIL_RUN_ID", request.run_id.clone()),
                ("ANVIL_PHASE_ID", request.phase_id.clone()),
                ("ANVIL_CHANGED_FILES", request.changed_files.join("\n")),
            ],
        };
        let output = invocation.run(None).await?;
        if output.status.success() {
            return Ok(AuditResponse {
                passed: true,
                issues: Vec::new(),
            });
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let mut issues: Vec<String> = tail(&combined, MAX_ISSUE_LINES)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        if issues.is_empty() {
            issues.push(format!(
                "`{}` exited with code {}",
                self.command,
                output.status.code().unwrap_or(-1)
            ));
        }
        Ok(AuditResponse {
            passed: false,
            issues,
        })
    }
}

/// Passes everything. Used when no test command is configured.
pub struct NoopAuditor;

#[async_trait]
impl Auditor for NoopAuditor {
    async fn audit(&self, _request: &AuditRequest) -> Result<AuditResponse, ProviderError> {
        Ok(AuditResponse {
            passed: true,
            issues: Vec::new(),
        })
    }
}

/// Doctor over the same JSON-over-stdio protocol as the builder.
pub struct CommandDoctor {
    command: String,
    project_dir: PathBuf,
    timeout: Duration,
}

impl CommandDoctor {
    pub fn new(command: impl Into<String>, project_dir: impl AsRef<Path>, timeout_secs: u64) -> Self {
        Self {
            command: command.into(),
            project_dir: project_dir.as_ref().to_path_buf(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl Doctor for CommandDoctor {
    async fn diagnose(&self, request: &DoctorRequest) -> Result<Verdict, ProviderError> {
        let invocation = Invocation {
            command: &self.command,
            project_dir: &self.project_dir,
            timeout: self.timeout,
            env: vec![
                ("ANVIL_RUN_ID", request.run_id.clone()),
                ("ANVIL_PHASE_ID", request.phase_id.clone()),
            ],
        };
        invocation.call_json(request).await
    }
}
