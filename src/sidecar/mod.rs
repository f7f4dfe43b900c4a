//! DNS-filtering sidecar lifecycle.
//!
//! The sidecar is a dnsmasq container pinned to the environment network's
//! reserved address. dnsmasq has no live-reconfiguration API and the main
//! container's DNS pointer is fixed at its own creation time, so policy
//! changes replace the whole container at the same address. Reload runs
//! start-new/verify/remove-old: the replacement starts on the staging
//! address, must pass the readiness canary, and only then is the old
//! sidecar removed and the replacement moved onto the reserved address. A
//! failed replacement start leaves the old sidecar serving the previous
//! policy; the brief resolution gap during the address swap is the accepted
//! tradeoff against restarting the main container.

pub mod render;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SidecarSettings;
use crate::docker::{ContainerSpec, DockerClient};
use crate::error::{EgressError, Result};
use crate::network::NetworkHandle;

pub use render::{matches_policy_domain, render_sidecar_config, READINESS_DOMAIN};

/// Where the rendered config is mounted inside the sidecar.
const CONTAINER_CONF_PATH: &str = "/etc/dnsmasq.conf";

/// Upper bound on a single readiness backoff step.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Manages launch, reload, and removal of the filtering sidecar.
pub struct SidecarManager<D: DockerClient> {
    docker: Arc<D>,
    image: String,
    readiness_attempts: u32,
    readiness_backoff: Duration,
}

impl<D: DockerClient> SidecarManager<D> {
    pub fn new(docker: Arc<D>, settings: &SidecarSettings) -> Self {
        Self {
            docker,
            image: settings.image.clone(),
            readiness_attempts: settings.readiness_attempts,
            readiness_backoff: Duration::from_millis(settings.readiness_backoff_ms),
        }
    }

    /// Start the sidecar at the handle's reserved address and wait for the
    /// canary resolution. On readiness timeout the half-started container is
    /// removed and `SidecarStartTimeout` surfaces to the caller; there is no
    /// silent unfiltered fallback.
    pub async fn launch(&self, handle: &mut NetworkHandle, config_path: &Path) -> Result<()> {
        let name = NetworkHandle::sidecar_name(&handle.env_id);

        // Sweep any leftover container holding the canonical name.
        self.docker.remove_container(&name).await?;

        let id = self
            .start_at(&name, handle, handle.sidecar_ip, config_path)
            .await?;

        if let Err(e) = self.wait_ready(&id, &name).await {
            let _ = self.docker.remove_container(&id).await;
            return Err(e);
        }

        tracing::info!("DNS sidecar {} ready at {}", name, handle.sidecar_ip);
        handle.sidecar_id = Some(id);
        Ok(())
    }

    /// Replace the sidecar's policy by swapping in a new container at the
    /// same reserved address.
    pub async fn reload(&self, handle: &mut NetworkHandle, config_path: &Path) -> Result<()> {
        if handle.sidecar_id.is_none() {
            // A previous provision stopped short of a running sidecar.
            return self.launch(handle, config_path).await;
        }

        let name = NetworkHandle::sidecar_name(&handle.env_id);
        let staging_name = NetworkHandle::staging_name(&handle.env_id);

        // Leftover staging container from an interrupted reload.
        self.docker.remove_container(&staging_name).await?;

        let new_id = self
            .start_at(&staging_name, handle, handle.staging_ip(), config_path)
            .await?;

        if let Err(e) = self.wait_ready(&new_id, &staging_name).await {
            // Old sidecar untouched; previous policy keeps serving.
            let _ = self.docker.remove_container(&new_id).await;
            return Err(e);
        }

        // Replacement verified; retire the old sidecar and move the new one
        // onto the reserved address.
        if let Some(old_id) = handle.sidecar_id.take() {
            self.docker.remove_container(&old_id).await?;
        }
        self.docker.remove_container(&name).await?;

        self.docker
            .disconnect_network(&handle.network_id, &new_id)
            .await?;
        self.docker
            .connect_network(&handle.network_id, &new_id, Some(handle.sidecar_ip))
            .await?;
        self.docker.rename_container(&new_id, &name).await?;

        tracing::info!("DNS sidecar {} reloaded at {}", name, handle.sidecar_ip);
        handle.sidecar_id = Some(new_id);
        Ok(())
    }

    /// Remove the sidecar container, including a staging container left by
    /// an interrupted reload. Tolerant of already-absent containers.
    pub async fn remove(&self, handle: &NetworkHandle) -> Result<()> {
        if let Some(id) = &handle.sidecar_id {
            self.docker.remove_container(id).await?;
        }
        self.docker
            .remove_container(&NetworkHandle::sidecar_name(&handle.env_id))
            .await?;
        self.docker
            .remove_container(&NetworkHandle::staging_name(&handle.env_id))
            .await?;
        Ok(())
    }

    async fn start_at(
        &self,
        name: &str,
        handle: &NetworkHandle,
        ip: std::net::Ipv4Addr,
        config_path: &Path,
    ) -> Result<String> {
        let spec = ContainerSpec {
            name: name.to_string(),
            image: self.image.clone(),
            cmd: vec!["-k".to_string(), "--log-facility=-".to_string()],
            network: handle.network_id.clone(),
            ipv4: Some(ip),
            binds: vec![format!(
                "{}:{}:ro",
                config_path.display(),
                CONTAINER_CONF_PATH
            )],
        };

        self.docker.run_container(&spec).await
    }

    /// Poll the canary resolution with bounded retries and exponential
    /// backoff until the resolver answers.
    async fn wait_ready(&self, container: &str, name: &str) -> Result<()> {
        let mut backoff = self.readiness_backoff;

        for attempt in 0..self.readiness_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }

            match self
                .docker
                .exec(container, &["nslookup", READINESS_DOMAIN, "127.0.0.1"])
                .await
            {
                Ok(out) if out.success() => return Ok(()),
                Ok(out) => {
                    tracing::debug!(
                        "Canary resolution in {} not ready yet (exit {}): {}",
                        name,
                        out.exit_code,
                        out.stdout.trim()
                    );
                }
                Err(e) => {
                    tracing::debug!("Canary exec in {} failed: {}", name, e);
                }
            }
        }

        Err(EgressError::SidecarStartTimeout {
            name: name.to_string(),
            attempts: self.readiness_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::MockDockerClient;
    use crate::network::NetworkManager;

    fn test_settings() -> SidecarSettings {
        SidecarSettings {
            readiness_attempts: 3,
            readiness_backoff_ms: 1,
            ..Default::default()
        }
    }

    async fn provisioned_handle(docker: &Arc<MockDockerClient>) -> NetworkHandle {
        let networks = NetworkManager::new(docker.clone(), false);
        let (handle, _) = networks.create_network("env1").await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_launch_pins_reserved_address() {
        let docker = Arc::new(MockDockerClient::new());
        let sidecar = SidecarManager::new(docker.clone(), &test_settings());
        let mut handle = provisioned_handle(&docker).await;

        sidecar.launch(&mut handle, Path::new("/tmp/dns.conf")).await.unwrap();

        let id = handle.sidecar_id.clone().unwrap();
        assert_eq!(docker.container_ip(&id), Some(handle.sidecar_ip));
        assert_eq!(docker.container_names(), vec!["ert-env1-dns"]);
    }

    #[tokio::test]
    async fn test_launch_timeout_removes_half_started_sidecar() {
        let docker = Arc::new(MockDockerClient::new().with_failing_exec("-dns"));
        let sidecar = SidecarManager::new(docker.clone(), &test_settings());
        let mut handle = provisioned_handle(&docker).await;

        let result = sidecar.launch(&mut handle, Path::new("/tmp/dns.conf")).await;
        assert!(matches!(
            result,
            Err(EgressError::SidecarStartTimeout { attempts: 3, .. })
        ));
        assert!(handle.sidecar_id.is_none());
        assert_eq!(docker.container_count(), 0);
    }

    #[tokio::test]
    async fn test_reload_swaps_container_but_keeps_address() {
        let docker = Arc::new(MockDockerClient::new());
        let sidecar = SidecarManager::new(docker.clone(), &test_settings());
        let mut handle = provisioned_handle(&docker).await;

        sidecar.launch(&mut handle, Path::new("/tmp/dns.conf")).await.unwrap();
        let first_id = handle.sidecar_id.clone().unwrap();
        let fixed_ip = handle.sidecar_ip;

        sidecar.reload(&mut handle, Path::new("/tmp/dns.conf")).await.unwrap();
        let second_id = handle.sidecar_id.clone().unwrap();

        assert_ne!(first_id, second_id);
        assert_eq!(handle.sidecar_ip, fixed_ip);
        assert_eq!(docker.container_ip(&second_id), Some(fixed_ip));
        // Exactly one sidecar left, carrying the canonical name.
        assert_eq!(docker.container_names(), vec!["ert-env1-dns"]);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_old_sidecar() {
        let docker = Arc::new(MockDockerClient::new());
        let sidecar = SidecarManager::new(docker.clone(), &test_settings());
        let mut handle = provisioned_handle(&docker).await;

        sidecar.launch(&mut handle, Path::new("/tmp/dns.conf")).await.unwrap();
        let old_id = handle.sidecar_id.clone().unwrap();

        // Replacement (staging name contains "-next") never becomes ready.
        let failing = Arc::new(MockDockerClient::new().with_failing_exec("-next"));
        let failing_sidecar = SidecarManager::new(failing.clone(), &test_settings());
        let networks = NetworkManager::new(failing.clone(), false);
        let (mut failing_handle, _) = networks.create_network("env1").await.unwrap();
        failing_sidecar
            .launch(&mut failing_handle, Path::new("/tmp/dns.conf"))
            .await
            .unwrap();
        let failing_old = failing_handle.sidecar_id.clone().unwrap();

        let result = failing_sidecar
            .reload(&mut failing_handle, Path::new("/tmp/dns.conf"))
            .await;
        assert!(matches!(result, Err(EgressError::SidecarStartTimeout { .. })));

        // Old sidecar untouched, staging cleaned up.
        assert_eq!(failing_handle.sidecar_id.as_deref(), Some(failing_old.as_str()));
        assert_eq!(failing.container_names(), vec!["ert-env1-dns"]);

        // The non-failing setup reloads fine afterwards.
        sidecar.reload(&mut handle, Path::new("/tmp/dns.conf")).await.unwrap();
        assert_ne!(handle.sidecar_id.as_deref(), Some(old_id.as_str()));
    }

    #[tokio::test]
    async fn test_reload_without_running_sidecar_launches() {
        let docker = Arc::new(MockDockerClient::new());
        let sidecar = SidecarManager::new(docker.clone(), &test_settings());
        let mut handle = provisioned_handle(&docker).await;

        sidecar.reload(&mut handle, Path::new("/tmp/dns.conf")).await.unwrap();
        assert!(handle.sidecar_id.is_some());
        assert_eq!(docker.container_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_sweeps_interrupted_reload_staging() {
        let docker = Arc::new(MockDockerClient::new());
        let sidecar = SidecarManager::new(docker.clone(), &test_settings());
        let mut handle = provisioned_handle(&docker).await;

        sidecar.launch(&mut handle, Path::new("/tmp/dns.conf")).await.unwrap();

        // Leftover replacement from a reload that died before the swap.
        docker
            .run_container(&ContainerSpec {
                name: NetworkHandle::staging_name("env1"),
                image: "dnsmasq:test".to_string(),
                cmd: vec![],
                network: handle.network_id.clone(),
                ipv4: Some(handle.staging_ip()),
                binds: vec![],
            })
            .await
            .unwrap();
        assert_eq!(docker.container_count(), 2);

        sidecar.remove(&handle).await.unwrap();
        assert_eq!(docker.container_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let docker = Arc::new(MockDockerClient::new());
        let sidecar = SidecarManager::new(docker.clone(), &test_settings());
        let mut handle = provisioned_handle(&docker).await;

        sidecar.launch(&mut handle, Path::new("/tmp/dns.conf")).await.unwrap();
        sidecar.remove(&handle).await.unwrap();
        sidecar.remove(&handle).await.unwrap();
        assert_eq!(docker.container_count(), 0);
    }
}
