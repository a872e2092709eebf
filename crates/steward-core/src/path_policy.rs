use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobMatcher};

use crate::config::FilesystemPolicyConfig;
use crate::error::{Result, StewardError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
        }
    }
}

struct CompiledPattern {
    raw: String,
    matcher: Option<GlobMatcher>,
}

impl CompiledPattern {
    fn new(raw: &str) -> Self {
        let matcher = Glob::new(raw).ok().map(|glob| glob.compile_matcher());
        Self {
            raw: raw.to_string(),
            matcher,
        }
    }

    fn matches(&self, target: &str) -> bool {
        if self.raw == "**" {
            return true;
        }
        if let Some(matcher) = &self.matcher {
            if matcher.is_match(target) {
                return true;
            }
        }
        // `dir/**` also covers the directory itself.
        if let Some(prefix) = self.raw.strip_suffix("/**") {
            let prefix = prefix.trim_end_matches('/');
            return target == prefix || target.starts_with(&format!("{prefix}/"));
        }
        false
    }
}

/// Repository-scoped filesystem access policy: normalized repo-relative
/// paths checked against deny, then mode-specific allow patterns, then the
/// default access.
pub struct PathPolicy {
    root: PathBuf,
    default_allow: bool,
    allow_read: Vec<CompiledPattern>,
    allow_write: Vec<CompiledPattern>,
    deny: Vec<CompiledPattern>,
}

impl PathPolicy {
    pub fn new(root: impl AsRef<Path>, config: &FilesystemPolicyConfig) -> Self {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|pattern| CompiledPattern::new(pattern))
                .collect::<Vec<_>>()
        };
        Self {
            root: root.as_ref().to_path_buf(),
            default_allow: config.default_access == "allow",
            allow_read: compile(&config.allow_read),
            allow_write: compile(&config.allow_write),
            deny: compile(&config.deny),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalize to a repository-root-relative POSIX path. Absolute paths
    /// and traversal (`..`) are rejected.
    pub fn normalize(&self, path: impl AsRef<Path>) -> Result<String> {
        let raw = path.as_ref();
        if raw.is_absolute() {
            return Err(StewardError::PathNotAllowed(
                "absolute paths are not supported for repo-scoped file access".to_string(),
            ));
        }
        let mut parts: Vec<String> = Vec::new();
        for component in raw.components() {
            match component {
                Component::Normal(part) => {
                    parts.push(part.to_string_lossy().to_string());
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(StewardError::PathNotAllowed(
                        "path traversal (`..`) is not allowed".to_string(),
                    ));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(StewardError::PathNotAllowed(
                        "absolute paths are not supported for repo-scoped file access".to_string(),
                    ));
                }
            }
        }
        if parts.is_empty() {
            return Ok(".".to_string());
        }
        Ok(parts.join("/"))
    }

    /// Absolute on-disk path for a repo-relative input, post-normalization.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let rel = self.normalize(path)?;
        if rel == "." {
            return Ok(self.root.clone());
        }
        Ok(self.root.join(rel))
    }

    /// Policy check. Returns the denial reason when not allowed.
    pub fn check_access(
        &self,
        path: impl AsRef<Path>,
        mode: AccessMode,
    ) -> Result<std::result::Result<(), String>> {
        let rel = self.normalize(path)?;
        if self.deny.iter().any(|pattern| pattern.matches(&rel)) {
            return Ok(Err(format!(
                "{} denied by policy for '{rel}'",
                mode.as_str()
            )));
        }
        let allow = match mode {
            AccessMode::Read => &self.allow_read,
            AccessMode::Write => &self.allow_write,
        };
        if allow.iter().any(|pattern| pattern.matches(&rel)) {
            return Ok(Ok(()));
        }
        if self.default_allow {
            return Ok(Ok(()));
        }
        Ok(Err(format!(
            "{} not allowed by policy for '{rel}'",
            mode.as_str()
        )))
    }

    pub fn can_read(&self, path: impl AsRef<Path>) -> bool {
        matches!(self.check_access(path, AccessMode::Read), Ok(Ok(())))
    }

    pub fn can_write(&self, path: impl AsRef<Path>) -> bool {
        matches!(self.check_access(path, AccessMode::Write), Ok(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PathPolicy {
        PathPolicy::new("/repo", &FilesystemPolicyConfig::default())
    }

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        let policy = policy();
        assert!(policy.normalize("../etc/passwd").is_err());
        assert!(policy.normalize("/etc/passwd").is_err());
        assert_eq!(policy.normalize("./memory/notes.md").unwrap(), "memory/notes.md");
    }

    #[test]
    fn default_policy_reads_everywhere_writes_scoped() {
        let policy = policy();
        assert!(policy.can_read("context/AGENT.md"));
        assert!(policy.can_write("outputs/report.md"));
        assert!(policy.can_write("memory/central/notes.txt"));
        assert!(!policy.can_write("src/lib.rs"));
    }

    #[test]
    fn deny_list_beats_allow_list() {
        let policy = policy();
        assert!(!policy.can_read("config/config.json"));
        assert!(!policy.can_write("config/config.json"));
        assert!(!policy.can_read(".git/HEAD"));
    }

    #[test]
    fn directory_glob_covers_directory_itself() {
        let policy = policy();
        assert!(policy.can_write("memory"));
        assert!(policy.can_write("outputs"));
    }
}
