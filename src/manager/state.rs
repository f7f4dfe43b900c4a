//! Persisted per-environment state and single-flight locking.
//!
//! Each provisioned environment owns one directory under the data root:
//!
//! ```text
//! <root>/<env_id>/
//!   allowed-domains   mutable rule lists (see rules module)
//!   blocked-domains
//!   dns.conf          last rendered sidecar config
//!   state.json        profile name + network handle
//! ```
//!
//! `state.json` is what makes provisioning survive process restarts: the
//! controller reloads the handle from disk instead of re-deriving it from
//! the Docker daemon.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EgressError, Result};
use crate::network::NetworkHandle;

const STATE_FILE: &str = "state.json";
const SIDECAR_CONF_FILE: &str = "dns.conf";

/// Everything persisted for one environment identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentState {
    /// Profile chosen at provision time; immutable for the environment's life.
    pub profile: String,
    /// Network attachment, present only for filtering profiles.
    pub handle: Option<NetworkHandle>,
}

/// Validate an environment identity before using it as a directory name or
/// Docker resource suffix.
pub fn validate_env_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 {
        return Err(EgressError::InvalidEnvironmentId {
            id: id.to_string(),
            reason: "must be 1-64 characters".to_string(),
        });
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(EgressError::InvalidEnvironmentId {
            id: id.to_string(),
            reason: "only alphanumerics, '-', '_' and '.' are allowed".to_string(),
        });
    }
    if id.starts_with('.') {
        return Err(EgressError::InvalidEnvironmentId {
            id: id.to_string(),
            reason: "cannot start with '.'".to_string(),
        });
    }
    Ok(())
}

/// File-backed store for [`EnvironmentState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Directory holding all persisted files for this environment.
    pub fn env_dir(&self, env_id: &str) -> PathBuf {
        self.root.join(env_id)
    }

    /// Path of the rendered sidecar config for this environment.
    pub fn sidecar_config_path(&self, env_id: &str) -> PathBuf {
        self.env_dir(env_id).join(SIDECAR_CONF_FILE)
    }

    /// Load the persisted state, or `None` when the environment is unknown.
    pub fn load(&self, env_id: &str) -> Result<Option<EnvironmentState>> {
        let path = self.env_dir(env_id).join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        let state = serde_json::from_str(&content).map_err(|e| {
            EgressError::State(format!("corrupt state for '{}': {}", env_id, e))
        })?;
        Ok(Some(state))
    }

    /// Persist the state, creating the environment directory if needed.
    pub fn save(&self, env_id: &str, state: &EnvironmentState) -> Result<()> {
        let dir = self.env_dir(env_id);
        std::fs::create_dir_all(&dir)?;

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| EgressError::State(format!("serialize state for '{}': {}", env_id, e)))?;
        std::fs::write(dir.join(STATE_FILE), content)?;
        Ok(())
    }

    /// Write the rendered sidecar config and return its path.
    pub fn write_sidecar_config(&self, env_id: &str, content: &str) -> Result<PathBuf> {
        let dir = self.env_dir(env_id);
        std::fs::create_dir_all(&dir)?;

        let path = self.sidecar_config_path(env_id);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Remove the whole environment directory (state, rendered config, and
    /// rule lists). Absent directories are not an error, so destroy retries
    /// stay idempotent.
    pub fn purge(&self, env_id: &str) -> Result<()> {
        match std::fs::remove_dir_all(self.env_dir(env_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Per-identity async locks serializing provision/reconfigure/destroy.
///
/// Operations on one identity queue; operations on different identities run
/// concurrently. The registry itself is guarded by a short-lived sync lock.
#[derive(Default)]
pub struct EnvLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EnvLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock for an identity. Callers hold the returned
    /// guard for the duration of the operation.
    pub fn acquire(&self, env_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(env_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once an identity is destroyed. Existing holders
    /// keep their Arc; only the registry entry is removed.
    pub fn release(&self, env_id: &str) {
        self.locks.lock().remove(env_id);
    }
}
