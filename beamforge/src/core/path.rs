//! Path normalization and write-permission rules for sandbox files.

use serde::{Deserialize, Serialize};

/// Allowed/protected prefix rules. Protected prefixes override allowed ones.
///
/// A prefix ending in `/` matches anything beneath it. A prefix without a
/// trailing slash matches the exact path or anything beneath `prefix/`, so
/// `src/api` covers `src/api/x.ts` but not `src/api_old.ts`. The empty prefix
/// matches every path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPolicy {
    pub allowed: Vec<String>,
    pub protected: Vec<String>,
    /// Extra prefixes a dependency install may write (manifests, lockfiles).
    #[serde(default)]
    pub install: Vec<String>,
}

impl PathPolicy {
    pub fn new(allowed: Vec<String>, protected: Vec<String>) -> Self {
        Self {
            allowed,
            protected,
            install: Vec::new(),
        }
    }

    pub fn with_install(mut self, install: Vec<String>) -> Self {
        self.install = install;
        self
    }

    /// Everything writable, nothing protected.
    pub fn permissive() -> Self {
        Self::new(vec![String::new()], Vec::new())
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.protected.iter().any(|prefix| matches_prefix(path, prefix))
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        self.allowed.iter().any(|prefix| matches_prefix(path, prefix))
    }

    pub fn can_write(&self, path: &str) -> bool {
        self.is_allowed(path) && !self.is_protected(path)
    }

    /// Writes made by a dependency install: allowed or install prefixes, never protected.
    pub fn can_install(&self, path: &str) -> bool {
        let listed = self.is_allowed(path)
            || self.install.iter().any(|prefix| matches_prefix(path, prefix));
        listed && !self.is_protected(path)
    }
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self::permissive()
    }
}

fn matches_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || prefix.ends_with('/') {
        return path.starts_with(prefix);
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Normalize a workspace-relative path: strip `./`, collapse duplicate
/// slashes, and reject absolute paths or `..` components.
pub fn normalize_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.contains('\\') {
        return None;
    }
    let mut parts = Vec::new();
    for part in trimmed.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
