//! Path normalization and scope checks shared by the plan, manifest and
//! patch code.

/// Normalize a relative path: strip `./`, collapse `.` and empty segments.
///
/// Returns `None` for empty, absolute, or `..`-containing paths. A trailing
/// `/` (directory marker) is preserved.
pub fn normalize_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return None;
    }
    // Windows drive letters (`C:`) are absolute too.
    if trimmed.len() >= 2 && trimmed.as_bytes()[1] == b':' {
        return None;
    }

    let is_dir = trimmed.ends_with('/');
    let mut parts = Vec::new();
    for seg in trimmed.split(['/', '\\']) {
        match seg {
            "" | "." => continue,
            ".." => return None,
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        return None;
    }

    let mut out = parts.join("/");
    if is_dir {
        out.push('/');
    }
    Some(out)
}

/// Whether `root` covers `path`.
///
/// Roots ending in `/` are prefixes; other roots match the exact path or
/// anything below it.
pub fn root_contains(root: &str, path: &str) -> bool {
    if root.ends_with('/') {
        path.starts_with(root) || path == root.trim_end_matches('/')
    } else {
        path == root
            || path
                .strip_prefix(root)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Whether `path` falls inside any protected entry.
pub fn is_protected(path: &str, protected: &[String]) -> bool {
    protected.iter().any(|p| root_contains(p, path))
}

/// Derive allowed roots for a phase.
///
/// Explicit scope wins. Otherwise each directory deliverable is a root and
/// each file deliverable allows its parent directory, or only itself when
/// it sits at the top level.
pub fn allowed_roots(deliverables: &[String], scope: &[String]) -> Vec<String> {
    let mut roots: Vec<String> = Vec::new();
    let mut push = |r: String| {
        if !roots.contains(&r) {
            roots.push(r);
        }
    };

    if !scope.is_empty() {
        for entry in scope.iter().filter_map(|s| normalize_path(s)) {
            push(entry);
        }
        return roots;
    }

    for d in deliverables.iter().filter_map(|d| normalize_path(d)) {
        if d.ends_with('/') {
            push(d);
        } else {
            match d.rsplit_once('/') {
                Some((parent, _)) => push(format!("{}/", parent)),
                None => push(d),
            }
        }
    }
    roots
}

/// One path that failed the scope check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeOffense {
    pub path: String,
    pub reason: ScopeReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeReason {
    Protected,
    OutsideRoots,
}

impl std::fmt::Display for ScopeOffense {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason {
            ScopeReason::Protected => write!(f, "{} (protected)", self.path),
            ScopeReason::OutsideRoots => write!(f, "{} (outside allowed roots)", self.path),
        }
    }
}

/// Check every path against the roots and the denylist.
///
/// The denylist wins over the roots: a protected path is rejected even when
/// an allowed root covers it.
pub fn check_scope<'a, I>(paths: I, roots: &[String], protected: &[String]) -> Vec<ScopeOffense>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut offenses = Vec::new();
    for path in paths {
        let reason = if is_protected(path, protected) {
            Some(ScopeReason::Protected)
        } else if !roots.iter().any(|r| root_contains(r, path)) {
            Some(ScopeReason::OutsideRoots)
        } else {
            None
        };
        if let Some(reason) = reason {
            offenses.push(ScopeOffense {
                path: path.to_string(),
                reason,
            });
        }
    }
    offenses
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src//lib.rs").as_deref(), Some("src/lib.rs"));
        assert_eq!(normalize_path("src/./db/").as_deref(), Some("src/db/"));
        assert_eq!(normalize_path("/etc/passwd"), None);
        assert_eq!(normalize_path("src/../../x"), None);
        assert_eq!(normalize_path("C:\\x"), None);
        assert_eq!(normalize_path("  "), None);
        assert_eq!(normalize_path("./"), None);
    }

    #[test]
    fn test_root_contains_prefix_and_exact() {
        assert!(root_contains("src/", "src/a.rs"));
        assert!(root_contains("src/", "src/deep/b.rs"));
        assert!(!root_contains("src/", "srcx/a.rs"));
        assert!(root_contains("README.md", "README.md"));
        assert!(!root_contains("README.md", "README.md.bak"));
        assert!(root_contains("docs", "docs/x.md"));
        assert!(!root_contains("docs", "docsx/x.md"));
    }

    #[test]
    fn test_allowed_roots_derived_from_deliverables() {
        let roots = allowed_roots(
            &strings(&["src/models.rs", "src/api/", "README.md", "src/lib.rs"]),
            &[],
        );
        assert_eq!(roots, strings(&["src/", "src/api/", "README.md"]));
    }

    #[test]
    fn test_allowed_roots_explicit_scope_wins() {
        let roots = allowed_roots(&strings(&["src/a.rs"]), &strings(&["lib/", "./tools"]));
        assert_eq!(roots, strings(&["lib/", "tools"]));
    }

    #[test]
    fn test_check_scope_names_offenders() {
        let roots = strings(&["src/"]);
        let protected = strings(&[".anvil/", ".git/", "protected/"]);
        let offenses = check_scope(
            ["src/a.rs", "protected/system.cfg", "other/b.rs"],
            &roots,
            &protected,
        );
        assert_eq!(offenses.len(), 2);
        assert_eq!(offenses[0].path, "protected/system.cfg");
        assert_eq!(offenses[0].reason, ScopeReason::Protected);
        assert_eq!(offenses[1].reason, ScopeReason::OutsideRoots);
        assert!(offenses[1].to_string().contains("outside allowed roots"));
    }

    #[test]
    fn test_protected_beats_allowed_root() {
        let offenses = check_scope(
            [".anvil/state.db"],
            &strings(&[".anvil/"]),
            &strings(&[".anvil/"]),
        );
        assert_eq!(offenses[0].reason, ScopeReason::Protected);
    }
}
