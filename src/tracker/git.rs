use anyhow::{Context, Result};
use git2::{Repository, Signature};
use std::path::Path;

/// Commits the files of completed phases.
pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Open the repository if `project_dir` is a git work tree.
    pub fn discover(project_dir: &Path) -> Option<Self> {
        let repo = Repository::open(project_dir).ok()?;
        if repo.is_bare() {
            return None;
        }
        Some(Self { repo })
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    fn signature(&self) -> Result<Signature<'static>> {
        match self.repo.signature() {
            Ok(sig) => Ok(sig.to_owned()),
            Err(_) => Signature::now("anvil", "anvil@localhost").context("Failed to build signature"),
        }
    }

    /// Stage exactly `paths` and commit them as `[anvil] phase <id>: <name>`.
    ///
    /// Returns `None` when the staged tree equals HEAD's.
    pub fn commit_phase(&self, phase_id: &str, name: &str, paths: &[String]) -> Result<Option<String>> {
        let mut index = self.repo.index().context("Failed to open git index")?;

        for path in paths {
            let rel = Path::new(path);
            if self.workdir_path(rel).exists() {
                index
                    .add_path(rel)
                    .with_context(|| format!("Failed to stage {}", path))?;
            } else if let Err(e) = index.remove_path(rel) {
                tracing::debug!(path = %path, error = %e, "path not in index");
            }
        }
        index.write().context("Failed to write git index")?;

        let tree_id = index.write_tree().context("Failed to write tree")?;
        let parent = self.get_head_commit();
        if parent.as_ref().is_some_and(|p| p.tree_id() == tree_id) {
            tracing::debug!(phase_id, "nothing to commit");
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_id)?;
        let sig = self.signature()?;
        let message = format!("[anvil] phase {}: {}", phase_id, name);
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, &message, &tree, &parents)
            .context("Failed to create commit")?;

        tracing::info!(phase_id, commit = %commit_id, files = paths.len(), "phase committed");
        Ok(Some(commit_id.to_string()))
    }

    fn workdir_path(&self, rel: &Path) -> std::path::PathBuf {
        self.repo
            .workdir()
            .map(|w| w.join(rel))
            .unwrap_or_else(|| rel.to_path_buf())
    }

    /// Get current HEAD SHA (returns None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.get_head_commit().map(|c| c.id().to_string())
    }

    /// Message of the HEAD commit.
    pub fn head_message(&self) -> Option<String> {
        self.get_head_commit()
            .and_then(|c| c.message().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (GitTracker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        let tracker = GitTracker::new(dir.path()).unwrap();
        (tracker, dir)
    }

    #[test]
    fn test_discover_outside_repo_is_none() {
        let dir = tempdir().unwrap();
        assert!(GitTracker::discover(dir.path()).is_none());
    }

    #[test]
    fn test_commit_phase_on_unborn_branch() {
        let (tracker, dir) = setup_repo();
        assert!(tracker.head_sha().is_none());
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.py"), "x = 1\n").unwrap();

        let sha = tracker
            .commit_phase("models", "Data models", &["src/a.py".to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(sha.len(), 40);
        assert_eq!(tracker.head_sha(), Some(sha));
        assert_eq!(
            tracker.head_message().as_deref(),
            Some("[anvil] phase models: Data models")
        );
    }

    #[test]
    fn test_commit_phase_only_stages_given_paths() {
        let (tracker, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        fs::write(dir.path().join("stray.txt"), "not mine\n").unwrap();

        tracker
            .commit_phase("p1", "One", &["a.txt".to_string()])
            .unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(tree.get_name("a.txt").is_some());
        assert!(tree.get_name("stray.txt").is_none());
    }

    #[test]
    fn test_commit_phase_without_changes_returns_none() {
        let (tracker, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        tracker
            .commit_phase("p1", "One", &["a.txt".to_string()])
            .unwrap();
        let again = tracker
            .commit_phase("p1", "One", &["a.txt".to_string()])
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_commit_phase_records_deletion() {
        let (tracker, dir) = setup_repo();
        fs::write(dir.path().join("old.txt"), "bye\n").unwrap();
        tracker
            .commit_phase("p1", "Add", &["old.txt".to_string()])
            .unwrap();
        fs::remove_file(dir.path().join("old.txt")).unwrap();
        tracker
            .commit_phase("p2", "Remove", &["old.txt".to_string()])
            .unwrap()
            .unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(tree.get_name("old.txt").is_none());
    }
}
