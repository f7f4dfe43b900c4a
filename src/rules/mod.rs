//! Per-environment mutable allow/block domain lists.
//!
//! Rules live beside the environment's other persisted state, as plain
//! newline-delimited files (`allowed-domains`, `blocked-domains`). They are
//! deliberately separate from the profile: the profile is fixed at provision
//! time, the rule lists stay writable for the environment's whole lifetime.
//! Mutations only take effect in the sidecar after the next reconfigure.

use std::path::PathBuf;

use crate::config::schema::validate_domain_pattern;
use crate::error::{EgressError, Result};

/// Which of the two rule lists to operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleList {
    Allow,
    Block,
}

impl RuleList {
    /// File name backing this list inside the environment directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            RuleList::Allow => "allowed-domains",
            RuleList::Block => "blocked-domains",
        }
    }

    /// Short label for user-facing output.
    pub fn label(&self) -> &'static str {
        match self {
            RuleList::Allow => "allow",
            RuleList::Block => "block",
        }
    }
}

/// Persisted, ordered, per-environment domain lists.
#[derive(Debug, Clone)]
pub struct RuleStore {
    root: PathBuf,
}

impl RuleStore {
    /// Create a store rooted at the per-environment state directory
    /// (each environment gets `<root>/<env_id>/`).
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn list_path(&self, env_id: &str, list: RuleList) -> PathBuf {
        self.root.join(env_id).join(list.file_name())
    }

    /// Add a domain to a list. Duplicate adds are a no-op.
    /// Returns whether the domain was newly added.
    pub fn add_domain(&self, env_id: &str, list: RuleList, domain: &str) -> Result<bool> {
        validate_domain_pattern(domain)?;

        let mut domains = self.list(env_id, list)?;
        if domains.iter().any(|d| d == domain) {
            tracing::debug!("Domain {} already in {} list", domain, list.file_name());
            return Ok(false);
        }

        domains.push(domain.to_string());
        self.write_list(env_id, list, &domains)?;
        Ok(true)
    }

    /// Remove a domain from a list. Removing an absent domain is a no-op.
    /// Returns whether the domain was present.
    pub fn remove_domain(&self, env_id: &str, list: RuleList, domain: &str) -> Result<bool> {
        let mut domains = self.list(env_id, list)?;
        let before = domains.len();
        domains.retain(|d| d != domain);

        if domains.len() == before {
            return Ok(false);
        }

        self.write_list(env_id, list, &domains)?;
        Ok(true)
    }

    /// List the domains in insertion order. A missing file is an empty list.
    pub fn list(&self, env_id: &str, list: RuleList) -> Result<Vec<String>> {
        let path = self.list_path(env_id, list);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&path)?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn write_list(&self, env_id: &str, list: RuleList, domains: &[String]) -> Result<()> {
        let path = self.list_path(env_id, list);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut content = domains.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        std::fs::write(&path, content).map_err(EgressError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, RuleStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = RuleStore::new(tmp.path().to_path_buf());
        (tmp, store)
    }

    #[test]
    fn test_add_and_list_preserves_order() {
        let (_tmp, store) = store();

        store.add_domain("env1", RuleList::Allow, "b.example.com").unwrap();
        store.add_domain("env1", RuleList::Allow, "a.example.com").unwrap();
        store.add_domain("env1", RuleList::Allow, "c.example.com").unwrap();

        let domains = store.list("env1", RuleList::Allow).unwrap();
        assert_eq!(domains, vec!["b.example.com", "a.example.com", "c.example.com"]);
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let (_tmp, store) = store();

        assert!(store.add_domain("env1", RuleList::Block, "evil.example.com").unwrap());
        assert!(!store.add_domain("env1", RuleList::Block, "evil.example.com").unwrap());

        let domains = store.list("env1", RuleList::Block).unwrap();
        assert_eq!(domains.len(), 1);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let (_tmp, store) = store();
        assert!(!store.remove_domain("env1", RuleList::Allow, "ghost.example.com").unwrap());
    }

    #[test]
    fn test_remove_domain() {
        let (_tmp, store) = store();

        store.add_domain("env1", RuleList::Allow, "a.example.com").unwrap();
        store.add_domain("env1", RuleList::Allow, "b.example.com").unwrap();
        assert!(store.remove_domain("env1", RuleList::Allow, "a.example.com").unwrap());

        let domains = store.list("env1", RuleList::Allow).unwrap();
        assert_eq!(domains, vec!["b.example.com"]);
    }

    #[test]
    fn test_lists_are_independent_per_environment() {
        let (_tmp, store) = store();

        store.add_domain("env1", RuleList::Allow, "a.example.com").unwrap();
        assert!(store.list("env2", RuleList::Allow).unwrap().is_empty());
    }

    #[test]
    fn test_persists_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = RuleStore::new(tmp.path().to_path_buf());
            store.add_domain("env1", RuleList::Allow, "pkg.example.com").unwrap();
        }
        let store = RuleStore::new(tmp.path().to_path_buf());
        assert_eq!(
            store.list("env1", RuleList::Allow).unwrap(),
            vec!["pkg.example.com"]
        );
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let (_tmp, store) = store();
        assert!(store.add_domain("env1", RuleList::Allow, "*").is_err());
    }
}
