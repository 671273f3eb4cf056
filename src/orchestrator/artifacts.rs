//! Per-attempt artifacts under `.anvil/attempts/<run>/<phase>/attempt-<n>/`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AttemptArtifacts {
    dir: PathBuf,
}

impl AttemptArtifacts {
    pub fn new(attempts_dir: &Path, run_id: &str, phase_id: &str, attempt: u32) -> Self {
        Self {
            dir: attempts_dir
                .join(run_id)
                .join(phase_id)
                .join(format!("attempt-{}", attempt)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_text(&self, name: &str, text: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.dir.join(name);
        std::fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let text = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize {}", name))?;
        self.write_text(name, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_artifacts_land_in_attempt_directory() {
        let dir = tempdir().unwrap();
        let artifacts = AttemptArtifacts::new(dir.path(), "abc123", "models", 2);
        let path = artifacts.write_text("patch.diff", "--- a\n").unwrap();
        assert_eq!(path, dir.path().join("abc123/models/attempt-2/patch.diff"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "--- a\n");

        let json = artifacts
            .write_json("request.json", &serde_json::json!({"mode": "patch"}))
            .unwrap();
        assert!(std::fs::read_to_string(json).unwrap().contains("\"patch\""));
    }
}
