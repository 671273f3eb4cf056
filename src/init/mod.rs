//! Initialization module for anvil projects.
//!
//! `anvil init` creates the `.anvil/` directory structure in a project:
//!
//! ```text
//! .anvil/
//! ├── anvil.toml       # Project configuration (defaults written on first init)
//! ├── state.db         # Durable phase store (created on first run)
//! ├── hints.json       # Learned hints, read-only to the executor
//! ├── leases/          # Run and workspace lease files
//! ├── logs/            # Daily-rolling JSON logs
//! └── attempts/        # Per-attempt request/response/patch artifacts
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::anvil_config::{AnvilToml, CONFIG_FILE};

/// The name of the anvil working directory.
pub const ANVIL_DIR: &str = ".anvil";

/// Result of initializing an anvil project.
#[derive(Debug)]
pub struct InitResult {
    /// Path to the created .anvil directory
    pub anvil_dir: PathBuf,
    /// Whether the directory was newly created (false if it already existed)
    pub created: bool,
}

/// Initialize an anvil project in the given directory.
///
/// Re-running on an initialized project only fills in whatever is missing;
/// an existing `anvil.toml` or `hints.json` is never overwritten.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let anvil_dir = project_dir.join(ANVIL_DIR);

    let created = if anvil_dir.exists() {
        ensure_directory_structure(&anvil_dir)?;
        false
    } else {
        std::fs::create_dir_all(&anvil_dir)
            .with_context(|| format!("Failed to create directory: {}", anvil_dir.display()))?;
        ensure_directory_structure(&anvil_dir)?;
        true
    };

    Ok(InitResult { anvil_dir, created })
}

/// Ensure all required subdirectories and files exist.
fn ensure_directory_structure(anvil_dir: &Path) -> Result<()> {
    for sub in ["leases", "logs", "attempts"] {
        let path = anvil_dir.join(sub);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create {} directory: {}", sub, path.display()))?;
    }

    let config_file = anvil_dir.join(CONFIG_FILE);
    if !config_file.exists() {
        AnvilToml::default().save(&config_file)?;
    }

    let hints_file = anvil_dir.join("hints.json");
    let yaml_hints = anvil_dir.join("hints.yaml");
    if !hints_file.exists() && !yaml_hints.exists() {
        std::fs::write(&hints_file, "[]\n")
            .with_context(|| format!("Failed to create hints.json: {}", hints_file.display()))?;
    }

    Ok(())
}

/// Check if a project is already initialized with anvil.
pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(ANVIL_DIR).exists()
}

/// Get the path to the anvil directory for a project.
pub fn get_anvil_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(ANVIL_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_project_creates_anvil_directory() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path()).unwrap();

        assert!(result.anvil_dir.exists());
        assert!(result.created);
        assert_eq!(result.anvil_dir, dir.path().join(".anvil"));
    }

    #[test]
    fn test_init_project_creates_required_subdirectories() {
        let dir = tempdir().unwrap();
        init_project(dir.path()).unwrap();

        let anvil_dir = dir.path().join(".anvil");
        assert!(anvil_dir.join("leases").is_dir());
        assert!(anvil_dir.join("logs").is_dir());
        assert!(anvil_dir.join("attempts").is_dir());
    }

    #[test]
    fn test_init_project_writes_default_config_and_hints() {
        let dir = tempdir().unwrap();
        init_project(dir.path()).unwrap();

        let anvil_dir = dir.path().join(".anvil");
        let config = AnvilToml::load(&anvil_dir.join("anvil.toml")).unwrap();
        assert_eq!(config.execution.max_retry_attempts, 3);
        assert_eq!(
            std::fs::read_to_string(anvil_dir.join("hints.json"))
                .unwrap()
                .trim(),
            "[]"
        );
    }

    #[test]
    fn test_init_project_existing_directory_returns_created_false() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".anvil")).unwrap();

        let result = init_project(dir.path()).unwrap();
        assert!(!result.created);
        assert!(dir.path().join(".anvil/leases").is_dir());
    }

    #[test]
    fn test_init_project_preserves_existing_config() {
        let dir = tempdir().unwrap();
        let anvil_dir = dir.path().join(".anvil");
        std::fs::create_dir_all(&anvil_dir).unwrap();
        std::fs::write(
            anvil_dir.join("anvil.toml"),
            "[execution]\nmax_retry_attempts = 9\n",
        )
        .unwrap();

        init_project(dir.path()).unwrap();
        let config = AnvilToml::load(&anvil_dir.join("anvil.toml")).unwrap();
        assert_eq!(config.execution.max_retry_attempts, 9);
    }

    #[test]
    fn test_init_project_keeps_yaml_hints() {
        let dir = tempdir().unwrap();
        let anvil_dir = dir.path().join(".anvil");
        std::fs::create_dir_all(&anvil_dir).unwrap();
        std::fs::write(anvil_dir.join("hints.yaml"), "[]\n").unwrap();

        init_project(dir.path()).unwrap();
        assert!(!anvil_dir.join("hints.json").exists());
    }

    #[test]
    fn test_is_initialized() {
        let dir = tempdir().unwrap();
        assert!(!is_initialized(dir.path()));
        init_project(dir.path()).unwrap();
        assert!(is_initialized(dir.path()));
        assert_eq!(get_anvil_dir(dir.path()), dir.path().join(".anvil"));
    }
}
