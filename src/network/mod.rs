//! Per-environment isolated network management.
//!
//! Each filtering environment gets its own bridge network, created with
//! inter-container communication disabled when the host supports it. Two
//! low addresses in the network's subnet are reserved: the gateway takes
//! `.1`, the sidecar is pinned to base + 2, and base + 3 is the staging
//! slot a replacement sidecar occupies during a reload.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::docker::DockerClient;
use crate::error::{EgressError, Result};

/// Offset of the sidecar's reserved address within the subnet.
const SIDECAR_ADDRESS_OFFSET: u32 = 2;

/// Attachment record for one provisioned environment.
///
/// `sidecar_ip` never changes while the handle exists; reloads replace the
/// sidecar container (and therefore `sidecar_id`) but re-attach it at the
/// same address, because the main container's DNS pointer is fixed at its
/// own creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHandle {
    pub env_id: String,
    pub network_id: String,
    pub sidecar_ip: Ipv4Addr,
    /// Container id of the currently running sidecar, if any.
    pub sidecar_id: Option<String>,
}

impl NetworkHandle {
    /// Canonical name of the per-environment network.
    pub fn network_name(env_id: &str) -> String {
        format!("ert-{}-net", env_id)
    }

    /// Canonical name of the sidecar container.
    pub fn sidecar_name(env_id: &str) -> String {
        format!("ert-{}-dns", env_id)
    }

    /// Name a replacement sidecar carries while it starts on the staging
    /// address during a reload.
    pub fn staging_name(env_id: &str) -> String {
        format!("{}-next", Self::sidecar_name(env_id))
    }

    /// Address a replacement sidecar occupies while the old one still
    /// holds the reserved address.
    pub fn staging_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.sidecar_ip) + 1)
    }
}

/// Non-fatal conditions surfaced alongside a successful provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionWarning {
    /// The preferred isolation option was unsupported; the environment runs
    /// on a less-isolated network instead of failing provisioning.
    DegradedIsolation { reason: String },
}

impl fmt::Display for ProvisionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionWarning::DegradedIsolation { reason } => {
                write!(f, "degraded isolation: {}", reason)
            }
        }
    }
}

/// Compute the nth usable address of a CIDR subnet.
fn nth_address(subnet: &str, n: u32) -> Option<Ipv4Addr> {
    let base: Ipv4Addr = subnet.split('/').next()?.parse().ok()?;
    Some(Ipv4Addr::from(u32::from(base) + n))
}

/// Creates and destroys the isolated per-environment networks.
pub struct NetworkManager<D: DockerClient> {
    docker: Arc<D>,
    disable_icc: bool,
}

impl<D: DockerClient> NetworkManager<D> {
    pub fn new(docker: Arc<D>, disable_icc: bool) -> Self {
        Self { docker, disable_icc }
    }

    /// Ensure the environment's network exists, returning a handle (without
    /// a sidecar) and any warnings. Idempotent: an existing network is
    /// reused as-is.
    pub async fn create_network(
        &self,
        env_id: &str,
    ) -> Result<(NetworkHandle, Vec<ProvisionWarning>)> {
        let name = NetworkHandle::network_name(env_id);
        let mut warnings = Vec::new();

        let info = match self.docker.inspect_network(&name).await? {
            Some(existing) => {
                tracing::debug!("Reusing existing network {} for {}", existing.id, env_id);
                existing
            }
            None if self.disable_icc => match self.docker.create_network(&name, true).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(
                        "ICC-disabled network rejected for {}, falling back to plain bridge: {}",
                        env_id,
                        e
                    );
                    let info = self.docker.create_network(&name, false).await?;
                    warnings.push(ProvisionWarning::DegradedIsolation {
                        reason: format!("inter-container communication cannot be disabled ({})", e),
                    });
                    info
                }
            },
            None => self.docker.create_network(&name, false).await?,
        };

        let subnet = info.subnet.as_deref().ok_or_else(|| {
            EgressError::NetworkUnavailable(format!("network '{}' reports no IPAM subnet", name))
        })?;
        let sidecar_ip = nth_address(subnet, SIDECAR_ADDRESS_OFFSET).ok_or_else(|| {
            EgressError::NetworkUnavailable(format!("unparseable subnet '{}'", subnet))
        })?;

        Ok((
            NetworkHandle {
                env_id: env_id.to_string(),
                network_id: info.id,
                sidecar_ip,
                sidecar_id: None,
            },
            warnings,
        ))
    }

    /// Remove the environment's sidecar and network. Tolerant of resources
    /// that are already gone.
    pub async fn destroy_network(&self, handle: &NetworkHandle) -> Result<()> {
        if let Some(sidecar) = &handle.sidecar_id {
            self.docker.remove_container(sidecar).await?;
        }
        // Also sweep by name in case the recorded id is stale, and take the
        // reload staging container with it; a surviving endpoint would make
        // the network removal fail.
        self.docker
            .remove_container(&NetworkHandle::sidecar_name(&handle.env_id))
            .await?;
        self.docker
            .remove_container(&NetworkHandle::staging_name(&handle.env_id))
            .await?;
        self.docker.remove_network(&handle.network_id).await?;
        tracing::info!("Removed network {} for {}", handle.network_id, handle.env_id);
        Ok(())
    }
}
