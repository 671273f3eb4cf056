//! Unified configuration for anvil.
//!
//! Reads `.anvil/anvil.toml` and layers it file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-project"
//!
//! [execution]
//! max_retry_attempts = 3
//! max_iterations = 200
//! max_phases = 200
//! token_cap = 2000000
//! backoff_base_ms = 1000
//! backoff_max_ms = 30000
//! disable_provider_after = 3
//!
//! [budget]
//! safety_margin = 1.3
//! ceiling = 131072
//! ladder_medium = [8192, 16384, 32768]
//!
//! [budget.marginal]
//! source = 2400
//!
//! [lease]
//! ttl_seconds = 900
//! grace_seconds = 60
//! acquire_timeout_ms = 30000
//! poll_interval_ms = 250
//!
//! [scope]
//! protected = ["secrets/", "Cargo.lock"]
//!
//! [doctor]
//! command = "./scripts/doctor.sh"
//! run_cap = 5
//! phase_cap = 2
//! after_retries = 2
//!
//! [builder]
//! command = "./scripts/builder.sh"
//! timeout_secs = 900
//!
//! [auditor]
//! test_command = "cargo test"
//! timeout_secs = 600
//!
//! [git]
//! commit_phases = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the config file inside `.anvil/`.
pub const CONFIG_FILE: &str = "anvil.toml";

/// Project-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name (optional, defaults to directory name)
    #[serde(default)]
    pub name: Option<String>,
}

/// Executor loop limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Loop iterations per invocation before stopping early (resumable)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Upper bound on phases accepted at plan ingestion
    #[serde(default = "default_max_phases")]
    pub max_phases: u32,
    /// Output-token cap for a whole run; `None` means uncapped
    #[serde(default)]
    pub token_cap: Option<u64>,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Consecutive transient errors from one provider before it is disabled for the run
    #[serde(default = "default_disable_provider_after")]
    pub disable_provider_after: u32,
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_max_iterations() -> u32 {
    200
}

fn default_max_phases() -> u32 {
    200
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_disable_provider_after() -> u32 {
    3
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            max_iterations: default_max_iterations(),
            max_phases: default_max_phases(),
            token_cap: None,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            disable_provider_after: default_disable_provider_after(),
        }
    }
}

/// Token budget planner tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSection {
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    /// Hard ceiling for escalation beyond the ladder
    #[serde(default = "default_budget_ceiling")]
    pub ceiling: u32,
    #[serde(default)]
    pub ladder_low: Option<Vec<u32>>,
    #[serde(default)]
    pub ladder_medium: Option<Vec<u32>>,
    #[serde(default)]
    pub ladder_high: Option<Vec<u32>>,
    /// Per-category overhead overrides (e.g. `feature = 1500`)
    #[serde(default)]
    pub category_overhead: BTreeMap<String, u32>,
    /// Per-file-type marginal cost overrides (e.g. `source = 2400`)
    #[serde(default)]
    pub marginal: BTreeMap<String, u32>,
}

fn default_safety_margin() -> f64 {
    1.3
}

fn default_budget_ceiling() -> u32 {
    131_072
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            safety_margin: default_safety_margin(),
            ceiling: default_budget_ceiling(),
            ladder_low: None,
            ladder_medium: None,
            ladder_high: None,
            category_overhead: BTreeMap::new(),
            marginal: BTreeMap::new(),
        }
    }
}

/// Lease coordinator timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSection {
    #[serde(default = "default_lease_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_lease_grace")]
    pub grace_seconds: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_lease_ttl() -> u64 {
    900
}

fn default_lease_grace() -> u64 {
    60
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            ttl_seconds: default_lease_ttl(),
            grace_seconds: default_lease_grace(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Extra protected paths, on top of `.anvil/` and `.git/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeSection {
    #[serde(default)]
    pub protected: Vec<String>,
}

/// External re-planning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorSection {
    /// Doctor command; re-planning is disabled when unset
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_doctor_run_cap")]
    pub run_cap: u32,
    #[serde(default = "default_doctor_phase_cap")]
    pub phase_cap: u32,
    /// Failed retries on a phase before the Doctor is consulted
    #[serde(default = "default_doctor_after_retries")]
    pub after_retries: u32,
    #[serde(default = "default_doctor_timeout")]
    pub timeout_secs: u64,
}

fn default_doctor_run_cap() -> u32 {
    5
}

fn default_doctor_phase_cap() -> u32 {
    2
}

fn default_doctor_after_retries() -> u32 {
    2
}

fn default_doctor_timeout() -> u64 {
    300
}

impl Default for DoctorSection {
    fn default() -> Self {
        Self {
            command: None,
            run_cap: default_doctor_run_cap(),
            phase_cap: default_doctor_phase_cap(),
            after_retries: default_doctor_after_retries(),
            timeout_secs: default_doctor_timeout(),
        }
    }
}

/// Builder agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_builder_timeout")]
    pub timeout_secs: u64,
}

fn default_builder_timeout() -> u64 {
    900
}

impl Default for BuilderSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_builder_timeout(),
        }
    }
}

/// CI/test runner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditorSection {
    /// Test command run after each applied patch; no auditing when unset
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default = "default_auditor_timeout")]
    pub timeout_secs: u64,
}

fn default_auditor_timeout() -> u64 {
    600
}

impl Default for AuditorSection {
    fn default() -> Self {
        Self {
            test_command: None,
            timeout_secs: default_auditor_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitSection {
    /// Commit the changed files of each completed phase
    #[serde(default)]
    pub commit_phases: bool,
}

/// The complete anvil.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnvilToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default)]
    pub scope: ScopeSection,
    #[serde(default)]
    pub doctor: DoctorSection,
    #[serde(default)]
    pub builder: BuilderSection,
    #[serde(default)]
    pub auditor: AuditorSection,
    #[serde(default)]
    pub git: GitSection,
}

impl AnvilToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse anvil.toml")
    }

    /// Load configuration from `.anvil/anvil.toml`.
    /// Returns default configuration if file doesn't exist.
    pub fn load_or_default(anvil_dir: &Path) -> Result<Self> {
        let config_path = anvil_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize anvil.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Builder command: env `ANVIL_BUILDER_CMD` overrides the file.
    pub fn builder_cmd(&self) -> Option<String> {
        std::env::var("ANVIL_BUILDER_CMD")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.builder.command.clone())
    }

    /// Test command: env `ANVIL_TEST_CMD` overrides the file.
    pub fn test_cmd(&self) -> Option<String> {
        std::env::var("ANVIL_TEST_CMD")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.auditor.test_command.clone())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.budget.safety_margin < 1.0 {
            warnings.push(format!(
                "budget.safety_margin {} is below 1.0; predictions will be under-provisioned",
                self.budget.safety_margin
            ));
        }

        for (name, ladder) in [
            ("ladder_low", &self.budget.ladder_low),
            ("ladder_medium", &self.budget.ladder_medium),
            ("ladder_high", &self.budget.ladder_high),
        ] {
            if let Some(steps) = ladder {
                if steps.is_empty() {
                    warnings.push(format!("budget.{} is empty", name));
                } else if steps.windows(2).any(|w| w[0] >= w[1]) {
                    warnings.push(format!("budget.{} must be strictly increasing", name));
                } else if steps.last().is_some_and(|top| *top > self.budget.ceiling) {
                    warnings.push(format!(
                        "budget.{} top step exceeds budget.ceiling {}",
                        name, self.budget.ceiling
                    ));
                }
            }
        }

        for key in self.budget.marginal.keys() {
            if !matches!(key.as_str(), "source" | "test" | "doc" | "config" | "data") {
                warnings.push(format!(
                    "Unknown file type '{}' in budget.marginal (expected source, test, doc, config, data)",
                    key
                ));
            }
        }

        if self.lease.poll_interval_ms == 0 {
            warnings.push("lease.poll_interval_ms must be greater than 0".to_string());
        }
        if self.lease.ttl_seconds == 0 {
            warnings.push("lease.ttl_seconds must be greater than 0".to_string());
        }
        for (name, timeout) in [
            ("builder", self.builder.timeout_secs),
            ("auditor", self.auditor.timeout_secs),
        ] {
            if self.lease.ttl_seconds > 0 && self.lease.ttl_seconds < timeout {
                warnings.push(format!(
                    "lease.ttl_seconds {} is shorter than {}.timeout_secs {}; the lease relies on heartbeats during that call",
                    self.lease.ttl_seconds, name, timeout
                ));
            }
        }

        if self.execution.max_retry_attempts == 0 {
            warnings.push(
                "execution.max_retry_attempts is 0; every failure goes straight to review"
                    .to_string(),
            );
        }

        for entry in &self.scope.protected {
            if entry.starts_with('/') || entry.split('/').any(|c| c == "..") {
                warnings.push(format!(
                    "scope.protected entry '{}' must be a relative path without '..'",
                    entry
                ));
            }
        }

        if self.builder_cmd().is_none() {
            warnings.push(
                "No builder command configured ([builder] command or ANVIL_BUILDER_CMD)"
                    .to_string(),
            );
        }

        warnings
    }
}

/// Unified configuration that combines AnvilToml with runtime settings.
///
/// Merges settings from:
/// 1. anvil.toml file
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct AnvilConfig {
    pub project_dir: PathBuf,
    pub anvil_dir: PathBuf,
    pub toml: AnvilToml,
    pub verbose: bool,
    /// CLI override for `[execution] max_iterations`
    pub cli_max_iterations: Option<u32>,
}

impl AnvilConfig {
    /// Create a new AnvilConfig from a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let anvil_dir = project_dir.join(crate::init::ANVIL_DIR);
        let toml = AnvilToml::load_or_default(&anvil_dir)?;

        Ok(Self {
            project_dir,
            anvil_dir,
            toml,
            verbose: false,
            cli_max_iterations: None,
        })
    }

    /// Create AnvilConfig with CLI overrides.
    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        max_iterations: Option<u32>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_max_iterations = max_iterations;
        Ok(config)
    }

    /// Max loop iterations (CLI → file → default).
    pub fn max_iterations(&self) -> u32 {
        self.cli_max_iterations
            .unwrap_or(self.toml.execution.max_iterations)
    }

    pub fn builder_cmd(&self) -> Option<String> {
        self.toml.builder_cmd()
    }

    pub fn test_cmd(&self) -> Option<String> {
        self.toml.test_cmd()
    }

    /// Protected paths: the fixed `.anvil/` and `.git/` entries plus configured ones.
    pub fn protected_paths(&self) -> Vec<String> {
        let mut paths = vec![".anvil/".to_string(), ".git/".to_string()];
        for entry in &self.toml.scope.protected {
            if !paths.contains(entry) {
                paths.push(entry.clone());
            }
        }
        paths
    }

    pub fn config_file(&self) -> PathBuf {
        self.anvil_dir.join(CONFIG_FILE)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
