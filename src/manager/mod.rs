//! Egress controller - main orchestration module.
//!
//! The controller is the only component outer collaborators talk to. It
//! wires the profile registry, rule store, network manager, and sidecar
//! manager into three operations (provision, reconfigure, destroy) plus the
//! rule-list mutation surface. All state transitions are caller-triggered;
//! there is no background reconciliation loop. Operations on one
//! environment identity are serialized through [`state::EnvLocks`];
//! different identities proceed concurrently.

pub mod state;

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::config::EgressSettings;
use crate::docker::DockerClient;
use crate::error::{EgressError, Result};
use crate::network::{NetworkManager, ProvisionWarning};
use crate::profile::{EgressAction, FilterMode, Profile, ProfileRegistry, RuleAction};
use crate::rules::{RuleList, RuleStore};
use crate::sidecar::{matches_policy_domain, render_sidecar_config, SidecarManager};

pub use state::{validate_env_id, EnvironmentState, StateStore};

use self::state::EnvLocks;

/// Network-attachment parameters returned to the container-creation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkAttachment {
    /// No network at all (airgapped).
    None,
    /// Attach to the default network; no DNS override (permissive).
    HostDefault,
    /// Attach to the isolated network and point DNS at the sidecar.
    Filtered { network_id: String, dns: Ipv4Addr },
}

/// Result of a successful provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub attachment: NetworkAttachment,
    pub warnings: Vec<ProvisionWarning>,
}

/// The egress controller - entry point for all egress operations.
pub struct EgressController<D: DockerClient> {
    registry: ProfileRegistry,
    rules: RuleStore,
    state: StateStore,
    networks: NetworkManager<D>,
    sidecar: SidecarManager<D>,
    upstreams: Vec<String>,
    locks: EnvLocks,
}

impl<D: DockerClient> EgressController<D> {
    /// Create a controller from validated settings and a backend client.
    pub fn new(settings: &EgressSettings, docker: Arc<D>) -> Self {
        let envs_root = settings.data_dir().join("envs");

        Self {
            registry: ProfileRegistry::new(settings.profiles_dir()),
            rules: RuleStore::new(envs_root.clone()),
            state: StateStore::new(envs_root),
            networks: NetworkManager::new(docker.clone(), settings.network.disable_icc),
            sidecar: SidecarManager::new(docker, &settings.sidecar),
            upstreams: settings.sidecar.upstreams.clone(),
            locks: EnvLocks::new(),
        }
    }

    /// Provision egress control for an environment identity.
    ///
    /// Loads the profile; for filtering profiles creates the isolated
    /// network and launches the DNS sidecar using the current (possibly
    /// empty) rule set. Returns attachment parameters for the caller's
    /// container-creation step. Idempotent: an already-provisioned identity
    /// gets its existing attachment back.
    pub async fn provision(&self, env_id: &str, profile_name: &str) -> Result<Provisioned> {
        validate_env_id(env_id)?;
        let lock = self.locks.acquire(env_id);
        let _guard = lock.lock().await;

        let (profile, resume) = match self.state.load(env_id)? {
            Some(existing) => {
                if existing.profile != profile_name {
                    tracing::warn!(
                        "{} already provisioned with profile '{}', ignoring requested '{}'",
                        env_id,
                        existing.profile,
                        profile_name
                    );
                }
                let recorded = self.registry.load(&existing.profile)?;
                let sidecar_running = existing
                    .handle
                    .as_ref()
                    .is_some_and(|h| h.sidecar_id.is_some());
                if recorded.mode != FilterMode::Filtering || sidecar_running {
                    // Fully provisioned; hand back the recorded attachment.
                    return Ok(Provisioned {
                        attachment: self.attachment_for(&recorded, &existing),
                        warnings: Vec::new(),
                    });
                }
                // A previous filtering provision stopped before the sidecar
                // was running; finish it under the recorded profile. A
                // handle without a sidecar id is unfinished, not success.
                (recorded, true)
            }
            None => (self.registry.load(profile_name)?, false),
        };

        tracing::info!(
            "Provisioning {} with profile '{}' (mode {}){}",
            env_id,
            profile.name,
            profile.mode.as_str(),
            if resume { " [resuming]" } else { "" }
        );

        match profile.mode {
            FilterMode::None | FilterMode::Unrestricted => {
                let env_state = EnvironmentState {
                    profile: profile.name.clone(),
                    handle: None,
                };
                self.state.save(env_id, &env_state)?;
                Ok(Provisioned {
                    attachment: self.attachment_for(&profile, &env_state),
                    warnings: Vec::new(),
                })
            }
            FilterMode::Filtering => {
                let (mut handle, warnings) = self.networks.create_network(env_id).await?;

                // Persist the handle before the sidecar exists, so a crash
                // or readiness timeout still leaves destroy enough to clean
                // up, and the fixed sidecar address is never re-derived.
                self.state.save(
                    env_id,
                    &EnvironmentState {
                        profile: profile.name.clone(),
                        handle: Some(handle.clone()),
                    },
                )?;

                let config_path = self.render_config(env_id, &profile)?;
                self.sidecar.launch(&mut handle, &config_path).await?;

                self.state.save(
                    env_id,
                    &EnvironmentState {
                        profile: profile.name.clone(),
                        handle: Some(handle.clone()),
                    },
                )?;

                Ok(Provisioned {
                    attachment: NetworkAttachment::Filtered {
                        network_id: handle.network_id,
                        dns: handle.sidecar_ip,
                    },
                    warnings,
                })
            }
        }
    }

    /// Re-render the policy from the recorded profile plus the current rule
    /// lists and reload the sidecar at its existing address. A no-op for
    /// non-filtering profiles; safe to call repeatedly.
    pub async fn reconfigure(&self, env_id: &str) -> Result<()> {
        validate_env_id(env_id)?;
        let lock = self.locks.acquire(env_id);
        let _guard = lock.lock().await;

        let env_state = self
            .state
            .load(env_id)?
            .ok_or_else(|| EgressError::UnknownEnvironment(env_id.to_string()))?;

        let profile = self.registry.load(&env_state.profile)?;
        if profile.mode != FilterMode::Filtering {
            tracing::debug!(
                "Reconfigure of {} is a no-op (mode {})",
                env_id,
                profile.mode.as_str()
            );
            return Ok(());
        }

        // Reuse the recorded handle; recreate the network only if a prior
        // provision never got that far (create_network is idempotent).
        let mut handle = match env_state.handle {
            Some(handle) => handle,
            None => self.networks.create_network(env_id).await?.0,
        };

        let config_path = self.render_config(env_id, &profile)?;
        self.sidecar.reload(&mut handle, &config_path).await?;

        self.state.save(
            env_id,
            &EnvironmentState {
                profile: env_state.profile,
                handle: Some(handle),
            },
        )?;

        tracing::info!("Reconfigured egress policy for {}", env_id);
        Ok(())
    }

    /// Full teardown: sidecar, network, then persisted rules, in that
    /// order. Idempotent; an unknown identity is already destroyed.
    pub async fn destroy(&self, env_id: &str) -> Result<()> {
        validate_env_id(env_id)?;
        let lock = self.locks.acquire(env_id);
        let _guard = lock.lock().await;

        let Some(env_state) = self.state.load(env_id)? else {
            tracing::debug!("Destroy of {}: nothing provisioned", env_id);
            return Ok(());
        };

        if let Some(handle) = &env_state.handle {
            self.sidecar.remove(handle).await?;
            self.networks.destroy_network(handle).await?;
        }

        // Rules and state go last: a failed network removal above keeps the
        // user's lists intact for the retry.
        self.state.purge(env_id)?;
        self.locks.release(env_id);

        tracing::info!("Destroyed egress resources for {}", env_id);
        Ok(())
    }

    /// Add a domain to an environment's allow or block list. Takes effect
    /// in the sidecar at the next reconfigure.
    pub async fn add_domain(&self, env_id: &str, list: RuleList, domain: &str) -> Result<bool> {
        validate_env_id(env_id)?;
        let lock = self.locks.acquire(env_id);
        let _guard = lock.lock().await;
        self.rules.add_domain(env_id, list, domain)
    }

    /// Remove a domain from an environment's allow or block list.
    pub async fn remove_domain(&self, env_id: &str, list: RuleList, domain: &str) -> Result<bool> {
        validate_env_id(env_id)?;
        let lock = self.locks.acquire(env_id);
        let _guard = lock.lock().await;
        self.rules.remove_domain(env_id, list, domain)
    }

    /// List an environment's rule list in insertion order.
    pub fn list_domains(&self, env_id: &str, list: RuleList) -> Result<Vec<String>> {
        validate_env_id(env_id)?;
        self.rules.list(env_id, list)
    }

    /// Evaluate what the current policy would answer for a hostname,
    /// without touching the sidecar. Uses the same matching semantics as
    /// the rendered resolver config: block beats allow, listed domains
    /// cover their subdomains, everything unlisted follows the profile's
    /// default action.
    pub fn evaluate(&self, env_id: &str, hostname: &str) -> Result<EgressAction> {
        validate_env_id(env_id)?;

        let env_state = self
            .state
            .load(env_id)?
            .ok_or_else(|| EgressError::UnknownEnvironment(env_id.to_string()))?;
        let profile = self.registry.load(&env_state.profile)?;

        match profile.mode {
            FilterMode::None => return Ok(EgressAction::Deny),
            FilterMode::Unrestricted => return Ok(EgressAction::Allow),
            FilterMode::Filtering => {}
        }

        let matches = |pattern: &str| matches_policy_domain(hostname, pattern);

        let blocked = self.rules.list(env_id, RuleList::Block)?;
        let profile_blocks = profile
            .rules
            .iter()
            .filter(|r| r.action == RuleAction::Block)
            .any(|r| matches(&r.domain));
        if profile_blocks || blocked.iter().any(|d| matches(d)) {
            return Ok(EgressAction::Deny);
        }

        let allowed = self.rules.list(env_id, RuleList::Allow)?;
        let profile_allows = profile
            .rules
            .iter()
            .filter(|r| r.action == RuleAction::Allow)
            .any(|r| matches(&r.domain));
        if profile_allows || allowed.iter().any(|d| matches(d)) {
            return Ok(EgressAction::Allow);
        }

        Ok(profile.default_action)
    }

    /// Load the persisted state for an identity, if any.
    pub fn environment(&self, env_id: &str) -> Result<Option<EnvironmentState>> {
        validate_env_id(env_id)?;
        self.state.load(env_id)
    }

    fn attachment_for(&self, profile: &Profile, state: &EnvironmentState) -> NetworkAttachment {
        match &state.handle {
            Some(handle) => NetworkAttachment::Filtered {
                network_id: handle.network_id.clone(),
                dns: handle.sidecar_ip,
            },
            None => match profile.mode {
                FilterMode::None => NetworkAttachment::None,
                _ => NetworkAttachment::HostDefault,
            },
        }
    }

    fn render_config(&self, env_id: &str, profile: &Profile) -> Result<std::path::PathBuf> {
        let allowed = self.rules.list(env_id, RuleList::Allow)?;
        let blocked = self.rules.list(env_id, RuleList::Block)?;
        let rendered = render_sidecar_config(profile, &allowed, &blocked, &self.upstreams);
        self.state.write_sidecar_config(env_id, &rendered)
    }
}
