//! The executor loop.
//!
//! Each iteration sweeps failed phases, checks the stop conditions, claims
//! the next phase and runs one attempt:
//!
//! ```text
//! manifest request → manifest gate → patch request → patch pipeline → audit
//! ```
//!
//! The outcome is written back to the store before the next iteration.
//! Retry counters are never cached here; every iteration re-reads them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use console::style;
use tokio_util::sync::CancellationToken;

use crate::agents::{
    AuditRequest, Auditor, BuildMode, BuildRequest, BuildResponse, Builder, Doctor, DoctorRequest,
};
use crate::anvil_config::LeaseSection;
use crate::budget::BudgetPlanner;
use crate::config::Config;
use crate::doctor::{self, Action, FailureContext, FailureKind, Feedback, Policy, Verdict};
use crate::errors::{ProviderError, StartupError, StoreError};
use crate::exit_codes;
use crate::hints::HintStore;
use crate::lease::{LeaseCoordinator, LeaseGuard};
use crate::manifest::{Manifest, parse_manifest};
use crate::patch::{self, Governance, PatchRejection, scope};
use crate::store::{AttemptRecord, DbHandle, PhaseRecord, RunRecord, RunState, TokenEstimation};
use crate::tracker::GitTracker;

use super::artifacts::AttemptArtifacts;

const INTERRUPTED: &str = "interrupted by operator";

/// The external collaborators a run talks to.
#[derive(Clone)]
pub struct Agents {
    pub builder: Arc<dyn Builder>,
    pub auditor: Arc<dyn Auditor>,
    pub doctor: Option<Arc<dyn Doctor>>,
}

/// Tunables resolved from `anvil.toml` and the CLI.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub policy: Policy,
    pub planner: BudgetPlanner,
    pub lease: LeaseSection,
    pub protected: Vec<String>,
    pub max_iterations: u32,
    pub commit_phases: bool,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        let anvil = config.anvil_config();
        Self {
            policy: Policy::from_config(&anvil.toml),
            planner: BudgetPlanner::from_config(&anvil.toml.budget),
            lease: anvil.toml.lease.clone(),
            protected: anvil.protected_paths(),
            max_iterations: anvil.max_iterations(),
            commit_phases: anvil.toml.git.commit_phases,
        }
    }
}

/// How an `execute` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every phase is terminal.
    Finished(RunState),
    /// Stopped early; the run can be resumed.
    Paused { reason: String },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Finished(_) => exit_codes::SUCCESS,
            RunOutcome::Paused { .. } => exit_codes::RESUMABLE,
        }
    }
}

/// How one attempt ended.
enum Attempt {
    Succeeded {
        changed_files: Vec<String>,
    },
    Failed {
        kind: FailureKind,
        feedback: Feedback,
        /// Provider to blame for a transient error
        provider: Option<String>,
    },
    /// The phase is still EXECUTING and must be requeued.
    Interrupted(String),
}

impl Attempt {
    fn failed(kind: FailureKind, feedback: Feedback) -> Self {
        Attempt::Failed {
            kind,
            feedback,
            provider: None,
        }
    }

    fn rejected(rejection: &PatchRejection) -> Self {
        Self::failed(
            doctor::classify_rejection(rejection),
            Feedback::from_rejection(rejection),
        )
    }
}

/// What the loop does after a phase.
enum Next {
    Continue,
    /// Pause the run; the phase state is already settled.
    Pause(String),
}

/// Bookkeeping for one attempt.
#[derive(Debug, Default)]
struct Ledger {
    budget: u32,
    predicted: u32,
    tokens: u64,
    escalations: u32,
    stop_reason: Option<String>,
    patch_path: Option<String>,
}

pub struct Executor {
    config: Config,
    settings: ExecutorSettings,
    db: DbHandle,
    agents: Agents,
    leases: LeaseCoordinator,
    cancel: CancellationToken,
    /// Consecutive transient failures per provider, for this process only.
    transient: Mutex<HashMap<String, u32>>,
}

impl Executor {
    pub fn new(
        config: Config,
        settings: ExecutorSettings,
        db: DbHandle,
        agents: Agents,
        cancel: CancellationToken,
    ) -> Self {
        let leases = LeaseCoordinator::from_config(&settings.lease);
        Self {
            config,
            settings,
            db,
            agents,
            leases,
            cancel,
            transient: Mutex::new(HashMap::new()),
        }
    }

    /// Drive a run until every phase is terminal or it stops early.
    ///
    /// Errors before the first phase is claimed are [`StartupError`]s.
    pub async fn execute(&self, run_id: &str) -> Result<RunOutcome> {
        let run_lease = self
            .leases
            .acquire(&self.config.run_lease_path(run_id))
            .await
            .map_err(StartupError::from)?;

        let id = run_id.to_string();
        let run = self
            .db
            .call(move |s| s.get_run(&id))
            .await
            .map_err(|e| match e {
                StoreError::RunNotFound { run_id } => StartupError::RunNotFound { run_id },
                other => StartupError::StoreUnreachable {
                    path: self.config.db_path.clone(),
                    source: other,
                },
            })?;

        if run.state.is_terminal() {
            println!(
                "{} Run {} already finished: {}",
                style("•").dim(),
                run_id,
                run.state
            );
            return Ok(RunOutcome::Finished(run.state));
        }

        let id = run_id.to_string();
        let recovered = self
            .db
            .call(move |s| {
                let recovered = s.recover_orphaned(&id)?;
                s.mark_running(&id)?;
                Ok(recovered)
            })
            .await?;
        if !recovered.is_empty() {
            println!(
                "  {} Requeued {} interrupted phase(s): {}",
                style("↻").yellow(),
                recovered.len(),
                recovered.join(", ")
            );
        }

        tracing::info!(run_id, plan = ?run.plan_name, "run started");
        let hints = self.load_hints();
        let heartbeat = run_lease.heartbeat(self.leases.heartbeat_interval());
        let outcome = self.drive(run_id, &run_lease, &hints).await;
        drop(heartbeat);

        if let Err(e) = run_lease.release() {
            tracing::warn!(run_id, error = %e, "failed to release run lease");
        }
        outcome
    }

    async fn drive(&self, run_id: &str, run_lease: &LeaseGuard, hints: &HintStore) -> Result<RunOutcome> {
        let max_retry = self.settings.policy.max_retry_attempts;
        let mut iterations = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return self.pause(run_id, INTERRUPTED).await;
            }
            run_lease.renew().context("Run lease lost")?;

            let id = run_id.to_string();
            let swept = self
                .db
                .call(move |s| s.auto_reset_failed(&id, max_retry))
                .await?;
            for phase_id in &swept.needs_review {
                println!(
                    "{} Phase {} needs review: retries exhausted",
                    style("!").yellow().bold(),
                    style(phase_id).bold()
                );
                self.record_estimation(run_id, phase_id, "needs_review").await?;
            }

            let id = run_id.to_string();
            let run = self.db.call(move |s| s.get_run(&id)).await?;
            if let Some(cap) = run.token_cap
                && run.tokens_used >= cap
            {
                let reason = format!("token cap reached ({} of {} tokens)", run.tokens_used, cap);
                return self.pause(run_id, &reason).await;
            }
            if iterations >= self.settings.max_iterations {
                let reason = format!("iteration cap reached ({})", iterations);
                return self.pause(run_id, &reason).await;
            }

            let id = run_id.to_string();
            let Some(phase) = self.db.call(move |s| s.claim_next_phase(&id)).await? else {
                let id = run_id.to_string();
                return match self.db.call(move |s| s.finalize_run(&id)).await? {
                    Some(state) => self.finish(run_id, state).await,
                    None => self.pause(run_id, "no runnable phase").await,
                };
            };
            iterations += 1;

            if let Next::Pause(reason) = self.run_phase(&run, phase, hints, run_lease).await? {
                return self.pause(run_id, &reason).await;
            }
        }
    }

    async fn run_phase(
        &self,
        run: &RunRecord,
        phase: PhaseRecord,
        hints: &HintStore,
        run_lease: &LeaseGuard,
    ) -> Result<Next> {
        let plan = self.settings.planner.plan(
            &phase.category,
            phase.complexity,
            &phase.deliverables,
            phase.token_budget,
        );
        let (id, pid, planned) = (run.id.clone(), phase.phase_id.clone(), plan.budget);
        let (budget, history) = self
            .db
            .call(move |s| Ok((s.update_budget(&id, &pid, planned)?, s.list_attempts(&id, &pid)?)))
            .await?;

        let attempt_no = history.len() as u32 + 1;
        let feedback = if phase.retry_attempt > 0 {
            history
                .last()
                .and_then(|a| a.feedback.as_deref())
                .map(Feedback::from_stored)
        } else {
            None
        };
        let phase_hints = hints.for_phase(&phase.category, &phase.deliverables, &phase.scope);
        let governance = Governance {
            allowed_roots: scope::allowed_roots(&phase.deliverables, &phase.scope),
            protected: self.settings.protected.clone(),
        };

        println!(
            "{} Phase {} ({}) attempt {} · budget {}",
            style("▶").cyan().bold(),
            style(&phase.phase_id).bold(),
            phase.name,
            attempt_no,
            budget
        );
        tracing::info!(
            run_id = %run.id,
            phase_id = %phase.phase_id,
            attempt = attempt_no,
            retry_attempt = phase.retry_attempt,
            budget,
            predicted = plan.predicted,
            hints = phase_hints.len(),
            "attempt started"
        );

        let request = BuildRequest {
            mode: BuildMode::Manifest,
            run_id: run.id.clone(),
            phase_id: phase.phase_id.clone(),
            phase_name: phase.name.clone(),
            description: phase.description.clone(),
            category: phase.category.clone(),
            complexity: phase.complexity,
            deliverables: phase.deliverables.clone(),
            allowed_roots: governance.allowed_roots.clone(),
            protected: governance.protected.clone(),
            token_budget: budget,
            approved_manifest: None,
            feedback,
            hints: phase_hints,
            doctor_guidance: phase.doctor_guidance.clone(),
            disabled_providers: run.disabled_providers.clone(),
        };
        let has_hints = !request.hints.is_empty();

        let artifacts = AttemptArtifacts::new(
            &self.config.attempts_dir,
            &run.id,
            &phase.phase_id,
            attempt_no,
        );
        let mut ledger = Ledger {
            budget,
            predicted: plan.predicted,
            ..Default::default()
        };

        match self
            .attempt(&phase, request, &governance, &artifacts, &mut ledger, run_lease)
            .await?
        {
            Attempt::Succeeded { changed_files } => {
                self.on_success(&phase, attempt_no, &ledger, &changed_files)
                    .await
            }
            Attempt::Failed {
                kind,
                feedback,
                provider,
            } => {
                let failure = Failure {
                    kind,
                    feedback,
                    provider,
                    has_hints,
                };
                self.on_failure(run, &phase, attempt_no, &ledger, failure)
                    .await
            }
            Attempt::Interrupted(reason) => {
                let (id, pid, why, tokens) = (
                    run.id.clone(),
                    phase.phase_id.clone(),
                    reason.clone(),
                    ledger.tokens,
                );
                self.db
                    .call(move |s| {
                        s.add_tokens_used(&id, tokens)?;
                        s.requeue_interrupted(&id, &pid, &why)
                    })
                    .await?;
                Ok(Next::Pause(reason))
            }
        }
    }

    async fn attempt(
        &self,
        phase: &PhaseRecord,
        mut request: BuildRequest,
        governance: &Governance,
        artifacts: &AttemptArtifacts,
        ledger: &mut Ledger,
        run_lease: &LeaseGuard,
    ) -> Result<Attempt> {
        keep_artifact(artifacts.write_json("manifest-request.json", &request));
        let response = match self.generate(phase, &mut request, ledger).await? {
            Ok(response) => response,
            Err(end) => return Ok(end),
        };
        keep_artifact(artifacts.write_text("manifest-response.txt", &response.content));

        let raw = match parse_manifest(&response.content) {
            Ok(raw) => raw,
            Err(message) => {
                return Ok(Attempt::failed(
                    FailureKind::DeliverablesMismatch,
                    Feedback::new(
                        FailureKind::DeliverablesMismatch,
                        format!("manifest is not a JSON list of paths: {}", message),
                    ),
                ));
            }
        };
        let manifest = match Manifest::validate(&raw, &phase.deliverables, governance) {
            Ok(manifest) => manifest,
            Err(mismatch) => {
                return Ok(Attempt::failed(
                    FailureKind::DeliverablesMismatch,
                    Feedback::from_manifest(&mismatch),
                ));
            }
        };
        tracing::debug!(phase_id = %phase.phase_id, files = ?manifest.entries(), "manifest approved");

        request.mode = BuildMode::Patch;
        request.approved_manifest = Some(manifest.entries().to_vec());
        keep_artifact(artifacts.write_json("patch-request.json", &request));
        let response = match self.generate(phase, &mut request, ledger).await? {
            Ok(response) => response,
            Err(end) => return Ok(end),
        };
        ledger.patch_path = keep_artifact(artifacts.write_text("patch.diff", &response.content))
            .map(|p| p.display().to_string());

        let prepared = match patch::prepare(&response.content) {
            Ok(prepared) => prepared,
            Err(rejection) => return Ok(Attempt::rejected(&rejection)),
        };
        // Protected paths are a hard rejection. Any other stray path is
        // reported against the manifest.
        let paths = prepared.paths();
        let touches_protected = paths
            .iter()
            .any(|p| scope::is_protected(p, &governance.protected));
        if !touches_protected
            && let Err(mismatch) = manifest.check_patch(&paths, governance)
        {
            return Ok(Attempt::failed(
                FailureKind::DeliverablesMismatch,
                Feedback::from_manifest(&mismatch),
            ));
        }
        if let Err(rejection) = patch::enforce_scope(&prepared, governance) {
            return Ok(Attempt::rejected(&rejection));
        }

        run_lease.renew().context("Run lease lost")?;
        let lease_path = self.config.workspace_lease_path();
        let workspace = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Attempt::Interrupted(INTERRUPTED.to_string())),
            lease = self.leases.acquire(&lease_path) => lease,
        };
        let workspace = match workspace {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(phase_id = %phase.phase_id, error = %e, "workspace lease unavailable");
                return Ok(Attempt::Interrupted(format!("workspace lease unavailable: {}", e)));
            }
        };
        let heartbeat = workspace.heartbeat(self.leases.heartbeat_interval());

        let root = self.config.project_dir.clone();
        let applied = tokio::task::spawn_blocking(move || patch::apply(&root, &prepared))
            .await
            .context("Patch apply task failed")?;
        let applied = match applied {
            Ok(applied) => applied,
            Err(rejection) => return Ok(Attempt::rejected(&rejection)),
        };
        if !applied.repairs.is_empty() {
            tracing::info!(phase_id = %phase.phase_id, repairs = ?applied.repairs, "applied repaired patch");
        }
        if applied.direct_write {
            tracing::warn!(phase_id = %phase.phase_id, "new files written directly after context mismatch");
        }

        if let Some(end) = self.audit(phase, &applied, artifacts).await {
            self.revert(phase, applied).await;
            return Ok(end);
        }

        if self.settings.commit_phases {
            self.commit(phase, &applied.changed_files).await;
        }
        drop(heartbeat);
        if let Err(e) = workspace.release() {
            tracing::warn!(error = %e, "failed to release workspace lease");
        }

        Ok(Attempt::Succeeded {
            changed_files: applied.changed_files,
        })
    }

    /// Audit an applied patch. `None` means it passed.
    async fn audit(
        &self,
        phase: &PhaseRecord,
        applied: &patch::Applied,
        artifacts: &AttemptArtifacts,
    ) -> Option<Attempt> {
        let request = AuditRequest {
            run_id: phase.run_id.clone(),
            phase_id: phase.phase_id.clone(),
            changed_files: applied.changed_files.clone(),
            review_focus: Some(phase.description.clone()).filter(|d| !d.is_empty()),
        };
        let audit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Some(Attempt::Interrupted(INTERRUPTED.to_string())),
            audit = self.agents.auditor.audit(&request) => audit,
        };
        let audit = match audit {
            Ok(audit) => audit,
            Err(e) => {
                return Some(Attempt::failed(
                    doctor::classify_provider(&e),
                    Feedback::from_provider(&e),
                ));
            }
        };
        keep_artifact(artifacts.write_json("audit.json", &audit));
        if audit.passed {
            return None;
        }
        Some(Attempt::failed(
            FailureKind::TestFailed,
            Feedback::tests_failed(audit.issues),
        ))
    }

    /// Put back the files an unaudited patch changed. The caller still holds
    /// the workspace lease.
    async fn revert(&self, phase: &PhaseRecord, applied: patch::Applied) {
        let root = self.config.project_dir.clone();
        match tokio::task::spawn_blocking(move || patch::revert(&root, &applied)).await {
            Ok(Ok(())) => tracing::info!(phase_id = %phase.phase_id, "reverted unaudited changes"),
            Ok(Err(e)) => {
                tracing::warn!(phase_id = %phase.phase_id, error = %e, "failed to revert patch")
            }
            Err(e) => tracing::warn!(phase_id = %phase.phase_id, error = %e, "revert task failed"),
        }
    }

    /// One Builder round, escalating the budget in place on truncation.
    async fn generate(
        &self,
        phase: &PhaseRecord,
        request: &mut BuildRequest,
        ledger: &mut Ledger,
    ) -> Result<Result<BuildResponse, Attempt>> {
        loop {
            request.token_budget = ledger.budget;
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Ok(Err(Attempt::Interrupted(INTERRUPTED.to_string())));
                }
                result = self.agents.builder.generate(request) => result,
            };

            let response = match result.and_then(BuildResponse::into_result) {
                Ok(response) => response,
                Err(e) => {
                    return Ok(Err(Attempt::Failed {
                        kind: doctor::classify_provider(&e),
                        feedback: Feedback::from_provider(&e),
                        provider: Some(provider_of(&e)),
                    }));
                }
            };
            ledger.tokens += response.tokens_used;
            ledger.stop_reason = response.stop_reason.clone();
            self.clear_transient(response.provider_name());

            if !doctor::is_truncation(response.stop_reason.as_deref()) {
                return Ok(Ok(response));
            }

            let previous = ledger.budget;
            let Some(next) = self.settings.planner.escalate(phase.complexity, previous) else {
                return Ok(Err(Attempt::failed(
                    FailureKind::TokenTruncated,
                    Feedback::new(
                        FailureKind::TokenTruncated,
                        format!("output truncated at the {} token ceiling", previous),
                    ),
                )));
            };
            let (id, pid) = (phase.run_id.clone(), phase.phase_id.clone());
            ledger.budget = self
                .db
                .call(move |s| s.update_budget(&id, &pid, next))
                .await?;
            ledger.escalations += 1;

            tracing::info!(
                phase_id = %phase.phase_id,
                mode = ?request.mode,
                from = previous,
                to = ledger.budget,
                "output truncated, escalating budget"
            );
            println!(
                "  {} truncated at {} tokens, retrying with {}",
                style("↑").yellow(),
                previous,
                ledger.budget
            );
        }
    }

    async fn on_success(
        &self,
        phase: &PhaseRecord,
        attempt_no: u32,
        ledger: &Ledger,
        changed_files: &[String],
    ) -> Result<Next> {
        let record = attempt_record(phase, attempt_no, ledger, None, None);
        let (id, pid, tokens) = (phase.run_id.clone(), phase.phase_id.clone(), ledger.tokens);
        self.db
            .call(move |s| {
                s.record_attempt(&record)?;
                s.record_success(&id, &pid, tokens)
            })
            .await?;
        self.record_estimation(&phase.run_id, &phase.phase_id, "complete")
            .await?;

        println!(
            "{} Phase {} complete · {} file(s) · {} tokens",
            style("✓").green().bold(),
            style(&phase.phase_id).bold(),
            changed_files.len(),
            ledger.tokens
        );
        tracing::info!(
            phase_id = %phase.phase_id,
            files = changed_files.len(),
            tokens = ledger.tokens,
            escalations = ledger.escalations,
            "phase complete"
        );
        Ok(Next::Continue)
    }

    async fn on_failure(
        &self,
        run: &RunRecord,
        phase: &PhaseRecord,
        attempt_no: u32,
        ledger: &Ledger,
        failure: Failure,
    ) -> Result<Next> {
        let Failure {
            kind,
            feedback,
            provider,
            has_hints,
        } = failure;

        let record = attempt_record(phase, attempt_no, ledger, Some(kind), Some(feedback.to_json()));
        let (id, pid, tokens, reason) = (
            phase.run_id.clone(),
            phase.phase_id.clone(),
            ledger.tokens,
            feedback.reason(),
        );
        let retry = self
            .db
            .call(move |s| {
                s.record_attempt(&record)?;
                s.add_tokens_used(&id, tokens)?;
                s.record_failure(&id, &pid, kind, &reason)
            })
            .await?;

        println!(
            "{} Phase {} failed ({}): {} [{}/{}]",
            style("✗").red().bold(),
            style(&phase.phase_id).bold(),
            kind,
            first_line(&feedback.reason()),
            retry,
            self.settings.policy.max_retry_attempts
        );

        let consecutive_transient = if kind == FailureKind::TransientProviderError {
            self.bump_transient(provider.as_deref().unwrap_or("auditor"))
        } else {
            0
        };
        let ctx = FailureContext {
            retry_attempt: retry,
            has_hints,
            doctor_available: self.agents.doctor.is_some(),
            run_doctor_invocations: run.doctor_invocations,
            phase_doctor_invocations: phase.doctor_invocations,
            consecutive_transient,
        };

        match self.settings.policy.action(kind, &ctx) {
            Action::RetryWithFeedback | Action::NeedsReview => Ok(Next::Continue),
            Action::Backoff {
                delay,
                disable_provider,
            } => {
                if disable_provider && let Some(name) = provider {
                    let (id, provider_name) = (phase.run_id.clone(), name.clone());
                    let disabled = self
                        .db
                        .call(move |s| s.disable_provider(&id, &provider_name))
                        .await?;
                    tracing::warn!(provider = %name, consecutive_transient, ?disabled, "provider disabled for run");
                    println!("  {} provider {} disabled for this run", style("⊘").red(), name);
                }
                tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Ok(Next::Pause(INTERRUPTED.to_string())),
                    _ = tokio::time::sleep(delay) => Ok(Next::Continue),
                }
            }
            Action::ConsultDoctor => self.consult_doctor(phase, retry, feedback).await,
        }
    }

    async fn consult_doctor(&self, phase: &PhaseRecord, retry: u32, feedback: Feedback) -> Result<Next> {
        let Some(doctor) = &self.agents.doctor else {
            return Ok(Next::Continue);
        };

        let (id, pid) = (phase.run_id.clone(), phase.phase_id.clone());
        let history = self
            .db
            .call(move |s| {
                s.bump_doctor_invocations(&id, &pid)?;
                s.list_attempts(&id, &pid)
            })
            .await?;
        let request = DoctorRequest {
            run_id: phase.run_id.clone(),
            phase_id: phase.phase_id.clone(),
            phase_name: phase.name.clone(),
            description: phase.description.clone(),
            deliverables: phase.deliverables.clone(),
            retry_attempt: retry,
            failure_history: history
                .iter()
                .filter_map(|a| a.feedback.as_deref())
                .map(|f| Feedback::from_stored(f).reason())
                .collect(),
            feedback: Some(feedback),
        };

        let verdict = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Next::Pause(INTERRUPTED.to_string())),
            verdict = doctor.diagnose(&request) => verdict,
        };
        let verdict = match verdict {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(phase_id = %phase.phase_id, error = %e, "doctor unavailable, retrying without a verdict");
                return Ok(Next::Continue);
            }
        };
        println!("  {} doctor verdict: {}", style("⚕").magenta(), verdict);
        tracing::info!(phase_id = %phase.phase_id, %verdict, "doctor verdict");

        let (id, pid) = (phase.run_id.clone(), phase.phase_id.clone());
        match verdict {
            Verdict::Revise { guidance } => {
                self.db
                    .call(move |s| s.set_doctor_guidance(&id, &pid, &guidance))
                    .await?;
            }
            Verdict::Block { reason } => {
                let reason = format!("blocked by doctor: {}", reason);
                self.db
                    .call(move |s| s.mark_blocked(&id, &pid, &reason))
                    .await?;
                self.record_estimation(&phase.run_id, &phase.phase_id, "blocked")
                    .await?;
            }
            Verdict::GiveUp { reason } => {
                let reason = format!("doctor gave up: {}", reason);
                self.db
                    .call(move |s| s.mark_needs_review(&id, &pid, &reason))
                    .await?;
                self.record_estimation(&phase.run_id, &phase.phase_id, "needs_review")
                    .await?;
            }
        }
        Ok(Next::Continue)
    }

    /// Commit the phase's files when the project is a git work tree.
    async fn commit(&self, phase: &PhaseRecord, files: &[String]) {
        let root = self.config.project_dir.clone();
        let (pid, name, files) = (phase.phase_id.clone(), phase.name.clone(), files.to_vec());
        let result = tokio::task::spawn_blocking(move || match GitTracker::discover(&root) {
            Some(tracker) => tracker.commit_phase(&pid, &name, &files),
            None => {
                tracing::debug!("not a git work tree, skipping phase commit");
                Ok(None)
            }
        })
        .await;

        match result {
            Ok(Ok(Some(sha))) => {
                println!("  {} committed {}", style("⎇").dim(), &sha[..sha.len().min(8)]);
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => tracing::warn!(phase_id = %phase.phase_id, error = %e, "phase commit failed"),
            Err(e) => tracing::warn!(phase_id = %phase.phase_id, error = %e, "phase commit task failed"),
        }
    }

    async fn record_estimation(&self, run_id: &str, phase_id: &str, outcome: &str) -> Result<()> {
        let (id, pid, outcome) = (run_id.to_string(), phase_id.to_string(), outcome.to_string());
        self.db
            .call(move |s| {
                let phase = s.get_phase(&id, &pid)?;
                let attempts = s.list_attempts(&id, &pid)?;
                s.record_token_estimation(&TokenEstimation {
                    predicted: attempts.last().map(|a| a.predicted).unwrap_or(0),
                    actual: attempts.iter().map(|a| a.actual_tokens).sum(),
                    budget: phase.token_budget.unwrap_or(0),
                    deliverable_count: phase.deliverables.len() as u32,
                    category: phase.category,
                    complexity: phase.complexity,
                    run_id: id,
                    phase_id: pid,
                    outcome,
                })
            })
            .await?;
        Ok(())
    }

    async fn pause(&self, run_id: &str, reason: &str) -> Result<RunOutcome> {
        let (id, why) = (run_id.to_string(), reason.to_string());
        self.db.call(move |s| s.pause_run(&id, &why)).await?;
        println!(
            "{} Run {} paused: {} (resume with `anvil resume {}`)",
            style("⏸").yellow().bold(),
            run_id,
            reason,
            run_id
        );
        Ok(RunOutcome::Paused {
            reason: reason.to_string(),
        })
    }

    async fn finish(&self, run_id: &str, state: RunState) -> Result<RunOutcome> {
        let id = run_id.to_string();
        let run = self.db.call(move |s| s.get_run(&id)).await?;
        let marker = match state {
            RunState::DoneSuccess => style("✓").green().bold(),
            _ => style("!").yellow().bold(),
        };
        println!(
            "{} Run {} finished: {} ({}, {} tokens)",
            marker,
            run_id,
            state,
            run.stop_reason.unwrap_or_default(),
            run.tokens_used
        );
        Ok(RunOutcome::Finished(state))
    }

    fn load_hints(&self) -> HintStore {
        match HintStore::load(&self.config.hints_file()) {
            Ok(hints) => {
                tracing::debug!(count = hints.len(), "learned hints loaded");
                hints
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable hints file");
                HintStore::default()
            }
        }
    }

    fn bump_transient(&self, provider: &str) -> u32 {
        let mut counts = self.transient.lock().unwrap_or_else(|p| p.into_inner());
        let count = counts.entry(provider.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn clear_transient(&self, provider: &str) {
        let mut counts = self.transient.lock().unwrap_or_else(|p| p.into_inner());
        counts.remove(provider);
    }
}

struct Failure {
    kind: FailureKind,
    feedback: Feedback,
    provider: Option<String>,
    has_hints: bool,
}

fn attempt_record(
    phase: &PhaseRecord,
    attempt_no: u32,
    ledger: &Ledger,
    failure_kind: Option<FailureKind>,
    feedback: Option<String>,
) -> AttemptRecord {
    AttemptRecord {
        run_id: phase.run_id.clone(),
        phase_id: phase.phase_id.clone(),
        attempt: attempt_no,
        budget: ledger.budget,
        predicted: ledger.predicted,
        actual_tokens: ledger.tokens,
        stop_reason: ledger.stop_reason.clone(),
        escalations: ledger.escalations,
        patch_path: ledger.patch_path.clone(),
        failure_kind,
        feedback,
    }
}

fn provider_of(error: &ProviderError) -> String {
    match error {
        ProviderError::Transient { provider, .. } | ProviderError::Rejected { provider, .. } => {
            provider.clone()
        }
        _ => "builder".to_string(),
    }
}

fn keep_artifact(written: Result<PathBuf>) -> Option<PathBuf> {
    match written {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::warn!(error = %e, "failed to write attempt artifact");
            None
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AuditResponse;
    use crate::init::init_project;
    use crate::lease::TryAcquire;
    use crate::plan::{Complexity, PhaseSpec, Plan, TierSpec};
    use crate::store::{PhaseState, PhaseStore};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    type Script =
        Box<dyn Fn(&BuildRequest, usize) -> Result<BuildResponse, ProviderError> + Send + Sync>;

    struct FakeBuilder {
        script: Script,
        requests: Mutex<Vec<BuildRequest>>,
        cancel_on: Option<(String, CancellationToken)>,
        delay: Option<Duration>,
    }

    impl FakeBuilder {
        fn new(
            script: impl Fn(&BuildRequest, usize) -> Result<BuildResponse, ProviderError>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            Self {
                script: Box::new(script),
                requests: Mutex::new(Vec::new()),
                cancel_on: None,
                delay: None,
            }
        }

        fn happy() -> Self {
            Self::new(|req, _| Ok(happy_response(req)))
        }

        fn requests(&self) -> Vec<BuildRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn manifest_phases(&self) -> Vec<String> {
            self.requests()
                .into_iter()
                .filter(|r| r.mode == BuildMode::Manifest)
                .map(|r| r.phase_id)
                .collect()
        }
    }

    #[async_trait]
    impl Builder for FakeBuilder {
        async fn generate(&self, request: &BuildRequest) -> Result<BuildResponse, ProviderError> {
            if let Some((phase_id, token)) = &self.cancel_on
                && request.phase_id == *phase_id
            {
                token.cancel();
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let n = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(request.clone());
                requests.len() - 1
            };
            (self.script)(request, n)
        }
    }

    struct FakeAuditor {
        results: Mutex<VecDeque<bool>>,
        fallback: bool,
    }

    impl FakeAuditor {
        fn passing() -> Self {
            Self::scripted(&[], true)
        }

        fn scripted(results: &[bool], fallback: bool) -> Self {
            Self {
                results: Mutex::new(results.iter().copied().collect()),
                fallback,
            }
        }
    }

    #[async_trait]
    impl Auditor for FakeAuditor {
        async fn audit(&self, _request: &AuditRequest) -> Result<AuditResponse, ProviderError> {
            let passed = self
                .results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback);
            Ok(AuditResponse {
                passed,
                issues: if passed {
                    vec![]
                } else {
                    vec!["test_models::test_roundtrip failed".to_string()]
                },
            })
        }
    }

    struct FakeDoctor {
        verdict: Verdict,
        requests: Mutex<Vec<DoctorRequest>>,
    }

    impl FakeDoctor {
        fn new(verdict: Verdict) -> Self {
            Self {
                verdict,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Doctor for FakeDoctor {
        async fn diagnose(&self, request: &DoctorRequest) -> Result<Verdict, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(self.verdict.clone())
        }
    }

    fn response(content: String) -> BuildResponse {
        BuildResponse {
            content,
            tokens_used: 100,
            stop_reason: Some("end_turn".to_string()),
            success: true,
            provider: Some("fast".to_string()),
            error: None,
        }
    }

    fn new_file_diff(paths: &[String]) -> String {
        paths
            .iter()
            .map(|p| {
                format!(
                    "diff --git a/{p} b/{p}\nnew file mode 100644\n--- /dev/null\n+++ b/{p}\n@@ -0,0 +1,1 @@\n+# {p}\n"
                )
            })
            .collect()
    }

    fn happy_response(req: &BuildRequest) -> BuildResponse {
        match req.mode {
            BuildMode::Manifest => response(serde_json::to_string(&req.deliverables).unwrap()),
            BuildMode::Patch => {
                response(new_file_diff(req.approved_manifest.as_deref().unwrap_or_default()))
            }
        }
    }

    fn phase_spec(id: &str, deliverables: &[&str]) -> PhaseSpec {
        PhaseSpec {
            id: id.to_string(),
            name: format!("Phase {}", id),
            description: String::new(),
            deliverables: deliverables.iter().map(|d| d.to_string()).collect(),
            category: "feature".to_string(),
            complexity: Complexity::Low,
            scope: Vec::new(),
        }
    }

    fn plan(tiers: Vec<Vec<PhaseSpec>>) -> Plan {
        Plan {
            name: Some("test plan".to_string()),
            tiers: tiers
                .into_iter()
                .enumerate()
                .map(|(i, phases)| TierSpec {
                    name: format!("tier-{}", i),
                    phases,
                })
                .collect(),
        }
    }

    struct Harness {
        _dir: TempDir,
        config: Config,
        db: DbHandle,
        settings: ExecutorSettings,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        init_project(dir.path()).unwrap();
        let config = Config::new(dir.path().to_path_buf(), false, None).unwrap();
        let db = DbHandle::new(PhaseStore::open_in_memory().unwrap());
        let mut settings = ExecutorSettings::from_config(&config);
        settings.policy.backoff_base = Duration::from_millis(1);
        settings.policy.backoff_max = Duration::from_millis(2);
        settings.lease.acquire_timeout_ms = 2_000;
        settings.lease.poll_interval_ms = 10;
        Harness {
            _dir: dir,
            config,
            db,
            settings,
        }
    }

    impl Harness {
        fn ingest(&self, plan: &Plan, token_cap: Option<u64>) -> String {
            let mut store = self.db.lock_sync().unwrap();
            store
                .ingest_plan(plan, 200, token_cap, &self.settings.protected)
                .unwrap()
        }

        fn executor(
            &self,
            builder: Arc<dyn Builder>,
            auditor: Arc<dyn Auditor>,
            doctor: Option<Arc<dyn Doctor>>,
            cancel: CancellationToken,
        ) -> Executor {
            Executor::new(
                self.config.clone(),
                self.settings.clone(),
                self.db.clone(),
                Agents {
                    builder,
                    auditor,
                    doctor,
                },
                cancel,
            )
        }

        fn phase(&self, run_id: &str, phase_id: &str) -> PhaseRecord {
            self.db.lock_sync().unwrap().get_phase(run_id, phase_id).unwrap()
        }

        fn run(&self, run_id: &str) -> RunRecord {
            self.db.lock_sync().unwrap().get_run(run_id).unwrap()
        }

        fn attempts(&self, run_id: &str, phase_id: &str) -> Vec<AttemptRecord> {
            self.db
                .lock_sync()
                .unwrap()
                .list_attempts(run_id, phase_id)
                .unwrap()
        }

        fn root(&self) -> &Path {
            &self.config.project_dir
        }
    }

    #[tokio::test]
    async fn test_run_completes_phases_in_tier_order() {
        let h = harness();
        let run_id = h.ingest(
            &plan(vec![
                vec![phase_spec("models", &["src/models.py"])],
                vec![phase_spec("tests", &["tests/test_models.py"])],
            ]),
            None,
        );
        let builder = Arc::new(FakeBuilder::happy());
        let exec = h.executor(
            builder.clone(),
            Arc::new(FakeAuditor::passing()),
            None,
            CancellationToken::new(),
        );

        let outcome = exec.execute(&run_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(RunState::DoneSuccess));
        assert_eq!(outcome.exit_code(), exit_codes::SUCCESS);

        assert_eq!(builder.manifest_phases(), vec!["models", "tests"]);
        assert!(h.root().join("src/models.py").exists());
        assert!(h.root().join("tests/test_models.py").exists());
        assert_eq!(h.phase(&run_id, "models").state, PhaseState::Complete);

        let run = h.run(&run_id);
        assert_eq!(run.state, RunState::DoneSuccess);
        assert_eq!(run.tokens_used, 400);

        let estimations = h.db.lock_sync().unwrap().list_token_estimations(&run_id).unwrap();
        assert_eq!(estimations.len(), 2);
        assert!(estimations.iter().all(|e| e.outcome == "complete" && e.actual == 200));

        let artifacts = h
            .config
            .attempts_dir
            .join(&run_id)
            .join("models")
            .join("attempt-1");
        assert!(artifacts.join("manifest-request.json").exists());
        assert!(artifacts.join("patch.diff").exists());
    }

    #[tokio::test]
    async fn test_truncation_escalates_budget_without_retry() {
        let h = harness();
        let deliverables = ["src/a.py", "src/b.py"];
        let run_id = h.ingest(&plan(vec![vec![phase_spec("p1", &deliverables)]]), None);

        let builder = Arc::new(FakeBuilder::new(|req, n| {
            if req.mode == BuildMode::Patch && n == 1 {
                let mut truncated = response(String::new());
                truncated.stop_reason = Some("max_tokens".to_string());
                return Ok(truncated);
            }
            Ok(happy_response(req))
        }));
        let exec = h.executor(
            builder.clone(),
            Arc::new(FakeAuditor::passing()),
            None,
            CancellationToken::new(),
        );
        exec.execute(&run_id).await.unwrap();

        let owned: Vec<String> = deliverables.iter().map(|d| d.to_string()).collect();
        let planner = &h.settings.planner;
        let initial = planner.plan("feature", Complexity::Low, &owned, None).budget;
        let escalated = planner.escalate(Complexity::Low, initial).unwrap();

        let patch_budgets: Vec<u32> = builder
            .requests()
            .iter()
            .filter(|r| r.mode == BuildMode::Patch)
            .map(|r| r.token_budget)
            .collect();
        assert_eq!(patch_budgets, vec![initial, escalated]);

        let phase = h.phase(&run_id, "p1");
        assert_eq!(phase.state, PhaseState::Complete);
        assert_eq!(phase.retry_attempt, 0);
        assert_eq!(phase.token_budget, Some(escalated));

        let attempts = h.attempts(&run_id, "p1");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].escalations, 1);
        assert_eq!(attempts[0].budget, escalated);
    }

    #[tokio::test]
    async fn test_scope_violation_rejected_before_any_write() {
        let mut h = harness();
        h.settings.protected.push("protected/".to_string());
        h.settings.max_iterations = 1;
        let run_id = h.ingest(&plan(vec![vec![phase_spec("p1", &["src/app.py"])]]), None);

        let builder = Arc::new(FakeBuilder::new(|req, _| match req.mode {
            BuildMode::Manifest => Ok(happy_response(req)),
            BuildMode::Patch => Ok(response(new_file_diff(&[
                "src/app.py".to_string(),
                "protected/system.cfg".to_string(),
            ]))),
        }));
        let exec = h.executor(
            builder,
            Arc::new(FakeAuditor::passing()),
            None,
            CancellationToken::new(),
        );

        let outcome = exec.execute(&run_id).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Paused { .. }));
        assert_eq!(outcome.exit_code(), exit_codes::RESUMABLE);

        assert!(!h.root().join("protected/system.cfg").exists());
        assert!(!h.root().join("src/app.py").exists());

        let phase = h.phase(&run_id, "p1");
        assert_eq!(phase.retry_attempt, 1);
        let reason = phase.last_failure_reason.unwrap();
        assert!(reason.starts_with("scope_violation"), "{}", reason);
        assert!(reason.contains("protected/system.cfg"));
        assert_eq!(
            h.attempts(&run_id, "p1")[0].failure_kind,
            Some(FailureKind::ScopeViolation)
        );
    }

    #[tokio::test]
    async fn test_manifest_mismatch_is_fed_back() {
        let h = harness();
        let run_id = h.ingest(
            &plan(vec![vec![phase_spec("p1", &["src/a.py", "src/b.py"])]]),
            None,
        );

        let builder = Arc::new(FakeBuilder::new(|req, n| {
            if req.mode == BuildMode::Patch && n == 1 {
                return Ok(response(new_file_diff(&[
                    "src/a.py".to_string(),
                    "src/c.py".to_string(),
                ])));
            }
            Ok(happy_response(req))
        }));
        let exec = h.executor(
            builder.clone(),
            Arc::new(FakeAuditor::passing()),
            None,
            CancellationToken::new(),
        );
        let outcome = exec.execute(&run_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(RunState::DoneSuccess));
        assert!(!h.root().join("src/c.py").exists());

        let attempts = h.attempts(&run_id, "p1");
        assert_eq!(attempts[0].failure_kind, Some(FailureKind::DeliverablesMismatch));
        let stored = Feedback::from_stored(attempts[0].feedback.as_deref().unwrap());
        let mismatch = stored.manifest.unwrap();
        assert_eq!(mismatch.missing, vec!["src/b.py"]);
        assert_eq!(mismatch.extra, vec!["src/c.py"]);

        let retry_request = &builder.requests()[2];
        assert_eq!(retry_request.mode, BuildMode::Manifest);
        let fed_back = retry_request.feedback.as_ref().unwrap();
        assert_eq!(fed_back.kind, Some(FailureKind::DeliverablesMismatch));
        assert_eq!(h.phase(&run_id, "p1").retry_attempt, 1);
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes_remaining_phases_in_order() {
        let h = harness();
        let phases = (1..=5)
            .map(|i| phase_spec(&format!("p{}", i), &[&format!("src/p{}.py", i)]))
            .collect();
        let run_id = h.ingest(&plan(vec![phases]), None);

        let cancel = CancellationToken::new();
        let mut interrupting = FakeBuilder::happy();
        interrupting.cancel_on = Some(("p3".to_string(), cancel.clone()));
        let first = h.executor(
            Arc::new(interrupting),
            Arc::new(FakeAuditor::passing()),
            None,
            cancel,
        );
        let outcome = first.execute(&run_id).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Paused {
                reason: INTERRUPTED.to_string()
            }
        );
        assert_eq!(h.run(&run_id).state, RunState::Paused);
        assert_eq!(h.phase(&run_id, "p2").state, PhaseState::Complete);
        let p3 = h.phase(&run_id, "p3");
        assert_eq!(p3.state, PhaseState::Queued);
        assert_eq!(p3.retry_attempt, 0);

        let builder = Arc::new(FakeBuilder::happy());
        let second = h.executor(
            builder.clone(),
            Arc::new(FakeAuditor::passing()),
            None,
            CancellationToken::new(),
        );
        let outcome = second.execute(&run_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(RunState::DoneSuccess));
        assert_eq!(builder.manifest_phases(), vec!["p3", "p4", "p5"]);
    }

    #[tokio::test]
    async fn test_orphaned_phase_is_recovered_on_start() {
        let h = harness();
        let run_id = h.ingest(&plan(vec![vec![phase_spec("p1", &["src/a.py"])]]), None);
        h.db.lock_sync()
            .unwrap()
            .claim_next_phase(&run_id)
            .unwrap()
            .unwrap();

        let exec = h.executor(
            Arc::new(FakeBuilder::happy()),
            Arc::new(FakeAuditor::passing()),
            None,
            CancellationToken::new(),
        );
        let outcome = exec.execute(&run_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(RunState::DoneSuccess));
        assert_eq!(h.phase(&run_id, "p1").retry_attempt, 0);
    }

    #[tokio::test]
    async fn test_token_cap_pauses_run() {
        let h = harness();
        let run_id = h.ingest(
            &plan(vec![vec![
                phase_spec("p1", &["src/a.py"]),
                phase_spec("p2", &["src/b.py"]),
            ]]),
            Some(150),
        );
        let exec = h.executor(
            Arc::new(FakeBuilder::happy()),
            Arc::new(FakeAuditor::passing()),
            None,
            CancellationToken::new(),
        );

        let outcome = exec.execute(&run_id).await.unwrap();
        let RunOutcome::Paused { reason } = outcome else {
            panic!("expected pause, got {:?}", outcome);
        };
        assert!(reason.contains("token cap"), "{}", reason);
        assert_eq!(h.phase(&run_id, "p1").state, PhaseState::Complete);
        assert_eq!(h.phase(&run_id, "p2").state, PhaseState::Queued);
        assert_eq!(h.run(&run_id).stop_reason.as_deref(), Some(reason.as_str()));
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_needs_review() {
        let mut h = harness();
        h.settings.policy.max_retry_attempts = 2;
        let run_id = h.ingest(
            &plan(vec![
                vec![phase_spec("p1", &["src/a.py"])],
                vec![phase_spec("p2", &["src/b.py"])],
            ]),
            None,
        );
        let exec = h.executor(
            Arc::new(FakeBuilder::happy()),
            Arc::new(FakeAuditor::scripted(&[false, false], true)),
            None,
            CancellationToken::new(),
        );

        let outcome = exec.execute(&run_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(RunState::DoneNeedsReview));

        let p1 = h.phase(&run_id, "p1");
        assert_eq!(p1.state, PhaseState::NeedsReview);
        assert_eq!(p1.retry_attempt, 2);
        let reason = p1.last_failure_reason.unwrap();
        assert!(reason.contains("retries exhausted after 2 attempts"), "{}", reason);
        assert!(reason.contains("test_failed"), "{}", reason);
        assert_eq!(h.phase(&run_id, "p2").state, PhaseState::Complete);

        let estimations = h.db.lock_sync().unwrap().list_token_estimations(&run_id).unwrap();
        assert!(
            estimations
                .iter()
                .any(|e| e.phase_id == "p1" && e.outcome == "needs_review")
        );
    }

    #[tokio::test]
    async fn test_doctor_block_stops_phase() {
        let mut h = harness();
        h.settings.policy.doctor_after_retries = 1;
        let run_id = h.ingest(&plan(vec![vec![phase_spec("p1", &["src/a.py"])]]), None);
        let doctor = Arc::new(FakeDoctor::new(Verdict::Block {
            reason: "needs a schema decision".to_string(),
        }));
        let exec = h.executor(
            Arc::new(FakeBuilder::happy()),
            Arc::new(FakeAuditor::scripted(&[], false)),
            Some(doctor.clone()),
            CancellationToken::new(),
        );

        let outcome = exec.execute(&run_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(RunState::DoneNeedsReview));

        let phase = h.phase(&run_id, "p1");
        assert_eq!(phase.state, PhaseState::Blocked);
        assert_eq!(
            phase.last_failure_reason.as_deref(),
            Some("blocked by doctor: needs a schema decision")
        );
        assert_eq!(phase.doctor_invocations, 1);
        assert_eq!(h.run(&run_id).doctor_invocations, 1);

        let requests = doctor.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].failure_history.len(), 1);
    }

    #[tokio::test]
    async fn test_doctor_guidance_reaches_next_request() {
        let mut h = harness();
        h.settings.policy.doctor_after_retries = 1;
        let run_id = h.ingest(&plan(vec![vec![phase_spec("p1", &["src/a.py"])]]), None);
        let builder = Arc::new(FakeBuilder::happy());
        let exec = h.executor(
            builder.clone(),
            Arc::new(FakeAuditor::scripted(&[false], true)),
            Some(Arc::new(FakeDoctor::new(Verdict::Revise {
                guidance: "split the module".to_string(),
            }))),
            CancellationToken::new(),
        );

        let outcome = exec.execute(&run_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(RunState::DoneSuccess));

        let requests = builder.requests();
        assert!(requests[0].doctor_guidance.is_none());
        assert_eq!(requests[2].doctor_guidance.as_deref(), Some("split the module"));
        assert_eq!(
            requests[2].feedback.as_ref().unwrap().kind,
            Some(FailureKind::TestFailed)
        );
        assert_eq!(h.phase(&run_id, "p1").retry_attempt, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_disable_provider() {
        let mut h = harness();
        h.settings.policy.max_retry_attempts = 5;
        h.settings.policy.disable_provider_after = 2;
        let run_id = h.ingest(&plan(vec![vec![phase_spec("p1", &["src/a.py"])]]), None);

        let builder = Arc::new(FakeBuilder::new(|req, n| {
            if n < 2 {
                return Err(ProviderError::Transient {
                    provider: "fast".to_string(),
                    message: "rate limited".to_string(),
                });
            }
            Ok(happy_response(req))
        }));
        let exec = h.executor(
            builder.clone(),
            Arc::new(FakeAuditor::passing()),
            None,
            CancellationToken::new(),
        );

        let outcome = exec.execute(&run_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(RunState::DoneSuccess));
        assert_eq!(h.run(&run_id).disabled_providers, vec!["fast"]);
        assert_eq!(builder.requests()[2].disabled_providers, vec!["fast"]);
        assert!(builder.requests()[1].disabled_providers.is_empty());
        assert_eq!(h.phase(&run_id, "p1").retry_attempt, 2);
    }

    #[tokio::test]
    async fn test_finished_run_is_not_executed_again() {
        let h = harness();
        let run_id = h.ingest(&plan(vec![vec![phase_spec("p1", &["src/a.py"])]]), None);
        h.executor(
            Arc::new(FakeBuilder::happy()),
            Arc::new(FakeAuditor::passing()),
            None,
            CancellationToken::new(),
        )
        .execute(&run_id)
        .await
        .unwrap();

        let builder = Arc::new(FakeBuilder::happy());
        let outcome = h
            .executor(
                builder.clone(),
                Arc::new(FakeAuditor::passing()),
                None,
                CancellationToken::new(),
            )
            .execute(&run_id)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Finished(RunState::DoneSuccess));
        assert!(builder.requests().is_empty());
    }

    #[tokio::test]
    async fn test_held_run_lease_is_a_startup_error() {
        let mut h = harness();
        h.settings.lease.acquire_timeout_ms = 50;
        let run_id = h.ingest(&plan(vec![vec![phase_spec("p1", &["src/a.py"])]]), None);

        let holder = LeaseCoordinator::from_config(&h.settings.lease);
        let TryAcquire::Acquired(_guard) = holder
            .try_acquire(&h.config.run_lease_path(&run_id))
            .unwrap()
        else {
            panic!("lease should be free");
        };

        let err = h
            .executor(
                Arc::new(FakeBuilder::happy()),
                Arc::new(FakeAuditor::passing()),
                None,
                CancellationToken::new(),
            )
            .execute(&run_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StartupError>(),
            Some(StartupError::LeaseUnavailable(_))
        ));
        assert_eq!(h.run(&run_id).state, RunState::Queued);
    }

    #[tokio::test]
    async fn test_stray_top_level_file_is_reported_as_manifest_mismatch() {
        let h = harness();
        let run_id = h.ingest(&plan(vec![vec![phase_spec("p1", &["a.py", "b.py"])]]), None);

        let builder = Arc::new(FakeBuilder::new(|req, n| {
            if req.mode == BuildMode::Patch && n == 1 {
                return Ok(response(new_file_diff(&[
                    "a.py".to_string(),
                    "c.py".to_string(),
                ])));
            }
            Ok(happy_response(req))
        }));
        let exec = h.executor(
            builder,
            Arc::new(FakeAuditor::passing()),
            None,
            CancellationToken::new(),
        );
        let outcome = exec.execute(&run_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(RunState::DoneSuccess));
        assert!(!h.root().join("c.py").exists());

        let attempts = h.attempts(&run_id, "p1");
        assert_eq!(attempts[0].failure_kind, Some(FailureKind::DeliverablesMismatch));
        let stored = Feedback::from_stored(attempts[0].feedback.as_deref().unwrap());
        let mismatch = stored.manifest.unwrap();
        assert_eq!(mismatch.missing, vec!["b.py"]);
        assert_eq!(mismatch.extra, vec!["c.py"]);
        assert_eq!(mismatch.forbidden, vec!["c.py"]);
    }

    #[tokio::test]
    async fn test_failed_audit_reverts_applied_patch() {
        let mut h = harness();
        h.settings.policy.max_retry_attempts = 1;
        std::fs::create_dir_all(h.root().join("src")).unwrap();
        std::fs::write(h.root().join("src/models.py"), "id = 1\n").unwrap();
        let run_id = h.ingest(
            &plan(vec![vec![phase_spec("p1", &["src/models.py", "src/api.py"])]]),
            None,
        );

        let builder = Arc::new(FakeBuilder::new(|req, _| match req.mode {
            BuildMode::Manifest => Ok(happy_response(req)),
            BuildMode::Patch => Ok(response(
                "--- a/src/models.py\n+++ b/src/models.py\n@@ -1,1 +1,1 @@\n-id = 1\n+id = 2\n"
                    .to_string()
                    + &new_file_diff(&["src/api.py".to_string()]),
            )),
        }));
        let exec = h.executor(
            builder,
            Arc::new(FakeAuditor::scripted(&[], false)),
            None,
            CancellationToken::new(),
        );
        let outcome = exec.execute(&run_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(RunState::DoneNeedsReview));

        assert_eq!(
            std::fs::read_to_string(h.root().join("src/models.py")).unwrap(),
            "id = 1\n"
        );
        assert!(!h.root().join("src/api.py").exists());
        assert_eq!(
            h.attempts(&run_id, "p1")[0].failure_kind,
            Some(FailureKind::TestFailed)
        );
    }

    #[tokio::test]
    async fn test_run_lease_stays_held_through_slow_builder_calls() {
        let mut h = harness();
        h.settings.lease.ttl_seconds = 1;
        h.settings.lease.grace_seconds = 0;
        let run_id = h.ingest(&plan(vec![vec![phase_spec("p1", &["src/a.py"])]]), None);

        let mut slow = FakeBuilder::happy();
        slow.delay = Some(Duration::from_millis(1500));
        let exec = h.executor(
            Arc::new(slow),
            Arc::new(FakeAuditor::passing()),
            None,
            CancellationToken::new(),
        );
        let rival = LeaseCoordinator::from_config(&h.settings.lease);
        let lease_path = h.config.run_lease_path(&run_id);

        let (outcome, rival_won) = tokio::join!(exec.execute(&run_id), async {
            tokio::time::sleep(Duration::from_millis(2200)).await;
            matches!(
                rival.try_acquire(&lease_path).unwrap(),
                TryAcquire::Acquired(_)
            )
        });
        assert!(!rival_won, "a second process took the run lease mid-call");
        assert_eq!(outcome.unwrap(), RunOutcome::Finished(RunState::DoneSuccess));
        assert!(h.root().join("src/a.py").exists());
    }
}
