use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::anvil_config::AnvilConfig;

/// Runtime configuration for anvil.
///
/// Bridges the unified `AnvilConfig` with the paths the executor needs
/// under `.anvil/`.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub anvil_dir: PathBuf,
    pub db_path: PathBuf,
    pub lease_dir: PathBuf,
    pub log_dir: PathBuf,
    pub attempts_dir: PathBuf,
    pub verbose: bool,
    anvil_config: AnvilConfig,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool, max_iterations: Option<u32>) -> Result<Self> {
        let anvil_config = AnvilConfig::with_cli_args(project_dir, verbose, max_iterations)?;
        let project_dir = anvil_config.project_dir.clone();
        let anvil_dir = anvil_config.anvil_dir.clone();

        Ok(Self {
            db_path: anvil_dir.join("state.db"),
            lease_dir: anvil_dir.join("leases"),
            log_dir: anvil_dir.join("logs"),
            attempts_dir: anvil_dir.join("attempts"),
            project_dir,
            anvil_dir,
            verbose,
            anvil_config,
        })
    }

    pub fn anvil_config(&self) -> &AnvilConfig {
        &self.anvil_config
    }

    /// Hints file: `hints.json` if present, otherwise `hints.yaml`.
    pub fn hints_file(&self) -> PathBuf {
        let json = self.anvil_dir.join("hints.json");
        if json.exists() {
            return json;
        }
        let yaml = self.anvil_dir.join("hints.yaml");
        if yaml.exists() { yaml } else { json }
    }

    /// Lease file guarding one run's executor loop.
    pub fn run_lease_path(&self, run_id: &str) -> PathBuf {
        self.lease_dir.join(format!("run-{}.lease", run_id))
    }

    /// Lease file guarding working-tree writes.
    pub fn workspace_lease_path(&self) -> PathBuf {
        self.lease_dir.join("workspace.lease")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.lease_dir).context("Failed to create lease directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.attempts_dir)
            .context("Failed to create attempts directory")?;
        Ok(())
    }
}
