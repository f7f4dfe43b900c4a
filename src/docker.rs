//! Docker API abstraction for testability.
//!
//! The [`DockerClient`] trait covers the narrow slice of the Docker API the
//! egress engine needs: per-environment networks, the DNS sidecar container,
//! and exec-based readiness probes. Production code uses
//! [`BollardDockerClient`]; tests use `MockDockerClient`.
//!
//! Removal operations treat "already absent" (404) as success, so teardown
//! paths can be retried safely.

use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::error::EgressError;

/// A created or inspected Docker network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    /// IPAM subnet in CIDR notation (e.g. "172.20.0.0/16"), when known.
    pub subnet: Option<String>,
}

/// Parameters for running the sidecar container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// Network to attach to at creation time.
    pub network: String,
    /// Static IPv4 address on that network.
    pub ipv4: Option<Ipv4Addr>,
    /// Host bind mounts, `host:container[:opts]` form.
    pub binds: Vec<String>,
}

/// Result of an exec inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait abstracting the Docker operations used by the egress engine.
pub trait DockerClient: Send + Sync + 'static {
    /// Checks Docker daemon connectivity.
    fn ping(&self) -> impl Future<Output = Result<(), EgressError>> + Send;

    /// Inspects a network by name or id. Returns `None` when absent.
    fn inspect_network(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<NetworkInfo>, EgressError>> + Send;

    /// Creates a bridge network, optionally with inter-container
    /// communication disabled.
    fn create_network(
        &self,
        name: &str,
        disable_icc: bool,
    ) -> impl Future<Output = Result<NetworkInfo, EgressError>> + Send;

    /// Removes a network. Absent networks are not an error.
    fn remove_network(&self, name: &str) -> impl Future<Output = Result<(), EgressError>> + Send;

    /// Creates and starts a container, returning its id.
    fn run_container(
        &self,
        spec: &ContainerSpec,
    ) -> impl Future<Output = Result<String, EgressError>> + Send;

    /// Force-removes a container by name or id. Absent containers are not an error.
    fn remove_container(&self, name: &str)
        -> impl Future<Output = Result<(), EgressError>> + Send;

    /// Renames a container.
    fn rename_container(
        &self,
        name: &str,
        new_name: &str,
    ) -> impl Future<Output = Result<(), EgressError>> + Send;

    /// Connects a container to a network, optionally at a static address.
    fn connect_network(
        &self,
        network: &str,
        container: &str,
        ipv4: Option<Ipv4Addr>,
    ) -> impl Future<Output = Result<(), EgressError>> + Send;

    /// Disconnects a container from a network. Already-disconnected is not an error.
    fn disconnect_network(
        &self,
        network: &str,
        container: &str,
    ) -> impl Future<Output = Result<(), EgressError>> + Send;

    /// Runs a command inside a container and captures its exit code and stdout.
    fn exec(
        &self,
        container: &str,
        cmd: &[&str],
    ) -> impl Future<Output = Result<ExecOutput, EgressError>> + Send;
}

/// Production Docker client implementation using `bollard`.
pub struct BollardDockerClient {
    docker: Arc<bollard::Docker>,
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl BollardDockerClient {
    /// Connect to Docker using the default local socket.
    pub fn connect_local() -> Result<Self, EgressError> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            EgressError::BackendConnection(format!("failed to connect to docker: {}", e))
        })?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    /// Connect to Docker using a specific socket path.
    pub fn connect_with_socket(socket_path: &str) -> Result<Self, EgressError> {
        let docker =
            bollard::Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    EgressError::BackendConnection(format!(
                        "failed to connect to docker at {}: {}",
                        socket_path, e
                    ))
                })?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    /// Pull an image, draining the progress stream.
    async fn pull_image(&self, image: &str) -> Result<(), EgressError> {
        use futures::TryStreamExt;

        tracing::info!("Pulling sidecar image {}", image);
        let options = bollard::image::CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| EgressError::Backend(format!("pull of '{}' failed: {}", image, e)))?;

        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, EgressError> {
        use bollard::container::{Config, CreateContainerOptions, StartContainerOptions};
        use bollard::models::{EndpointIpamConfig, EndpointSettings, HostConfig};

        let mut endpoints = HashMap::new();
        endpoints.insert(
            spec.network.clone(),
            EndpointSettings {
                ipam_config: spec.ipv4.map(|ip| EndpointIpamConfig {
                    ipv4_address: Some(ip.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                ..Default::default()
            }),
            networking_config: Some(bollard::container::NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| {
                EgressError::Backend(format!("create container '{}' failed: {}", spec.name, e))
            })?;

        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                EgressError::Backend(format!("start container '{}' failed: {}", spec.name, e))
            })?;

        Ok(created.id)
    }
}

impl DockerClient for BollardDockerClient {
    async fn ping(&self) -> Result<(), EgressError> {
        self.docker
            .ping()
            .await
            .map_err(|e| EgressError::BackendConnection(format!("ping failed: {}", e)))?;
        Ok(())
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>, EgressError> {
        use bollard::network::InspectNetworkOptions;

        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(network) => {
                let id = network.id.unwrap_or_else(|| name.to_string());
                let subnet = network
                    .ipam
                    .and_then(|ipam| ipam.config)
                    .and_then(|configs| configs.into_iter().find_map(|c| c.subnet));
                Ok(Some(NetworkInfo { id, subnet }))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(EgressError::Backend(format!(
                "inspect network '{}' failed: {}",
                name, e
            ))),
        }
    }

    async fn create_network(
        &self,
        name: &str,
        disable_icc: bool,
    ) -> Result<NetworkInfo, EgressError> {
        use bollard::network::CreateNetworkOptions;

        let mut options = HashMap::new();
        if disable_icc {
            options.insert(
                "com.docker.network.bridge.enable_icc".to_string(),
                "false".to_string(),
            );
        }

        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                options,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                EgressError::NetworkUnavailable(format!("create network '{}' failed: {}", name, e))
            })?;

        // Re-inspect to pick up the IPAM subnet Docker assigned.
        self.inspect_network(name).await?.ok_or_else(|| {
            EgressError::NetworkUnavailable(format!(
                "network '{}' vanished right after creation",
                name
            ))
        })
    }

    async fn remove_network(&self, name: &str) -> Result<(), EgressError> {
        match self.docker.remove_network(name).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(EgressError::Backend(format!(
                "remove network '{}' failed: {}",
                name, e
            ))),
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, EgressError> {
        match self.create_and_start(spec).await {
            Ok(id) => Ok(id),
            Err(first_err) => {
                // Most common cause is a missing image; pull and retry once.
                self.pull_image(&spec.image).await.map_err(|_| first_err)?;
                self.create_and_start(spec).await
            }
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), EgressError> {
        use bollard::container::RemoveContainerOptions;

        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(EgressError::Backend(format!(
                "remove container '{}' failed: {}",
                name, e
            ))),
        }
    }

    async fn rename_container(&self, name: &str, new_name: &str) -> Result<(), EgressError> {
        use bollard::container::RenameContainerOptions;

        self.docker
            .rename_container(
                name,
                RenameContainerOptions {
                    name: new_name.to_string(),
                },
            )
            .await
            .map_err(|e| {
                EgressError::Backend(format!(
                    "rename container '{}' -> '{}' failed: {}",
                    name, new_name, e
                ))
            })
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        ipv4: Option<Ipv4Addr>,
    ) -> Result<(), EgressError> {
        use bollard::models::{EndpointIpamConfig, EndpointSettings};
        use bollard::network::ConnectNetworkOptions;

        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container.to_string(),
                    endpoint_config: EndpointSettings {
                        ipam_config: ipv4.map(|ip| EndpointIpamConfig {
                            ipv4_address: Some(ip.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                },
            )
            .await
            .map_err(|e| {
                EgressError::Backend(format!(
                    "connect '{}' to network '{}' failed: {}",
                    container, network, e
                ))
            })
    }

    async fn disconnect_network(&self, network: &str, container: &str) -> Result<(), EgressError> {
        use bollard::network::DisconnectNetworkOptions;

        match self
            .docker
            .disconnect_network(
                network,
                DisconnectNetworkOptions {
                    container: container.to_string(),
                    force: true,
                },
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(EgressError::Backend(format!(
                "disconnect '{}' from network '{}' failed: {}",
                container, network, e
            ))),
        }
    }

    async fn exec(&self, container: &str, cmd: &[&str]) -> Result<ExecOutput, EgressError> {
        use bollard::exec::{CreateExecOptions, StartExecResults};
        use futures::StreamExt;

        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                EgressError::Backend(format!("exec create in '{}' failed: {}", container, e))
            })?;

        let mut stdout = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| {
                EgressError::Backend(format!("exec start in '{}' failed: {}", container, e))
            })?
        {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(bollard::container::LogOutput::StdOut { message })
                    | Ok(bollard::container::LogOutput::Console { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("exec output stream error: {}", e);
                        break;
                    }
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(|e| {
            EgressError::Backend(format!("exec inspect in '{}' failed: {}", container, e))
        })?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
        })
    }
}

/// Mock Docker client used by unit tests across the crate.
///
/// Tracks networks and containers in memory; behavior toggles simulate the
/// host rejecting ICC hardening, complete network allocation failure, and
/// readiness probes that never succeed.
#[cfg(test)]
pub struct MockDockerClient {
    state: parking_lot::Mutex<MockState>,
    /// Reject `create_network` calls that ask for ICC disable.
    pub fail_icc_networks: bool,
    /// Reject all `create_network` calls.
    pub fail_all_networks: bool,
    /// Exec exit code for containers whose name contains this substring
    /// (all other execs exit 0).
    pub failing_exec_substring: Option<String>,
}

#[cfg(test)]
#[derive(Default)]
struct MockState {
    networks: HashMap<String, MockNetwork>,
    containers: Vec<MockContainer>,
    next_id: u32,
}

#[cfg(test)]
#[derive(Debug, Clone)]
struct MockNetwork {
    id: String,
    subnet: String,
    icc_disabled: bool,
}

#[cfg(test)]
#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    name: String,
    network: Option<String>,
    ipv4: Option<Ipv4Addr>,
}

#[cfg(test)]
impl MockDockerClient {
    pub fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(MockState::default()),
            fail_icc_networks: false,
            fail_all_networks: false,
            failing_exec_substring: None,
        }
    }

    pub fn with_failing_icc(mut self) -> Self {
        self.fail_icc_networks = true;
        self
    }

    pub fn with_failing_networks(mut self) -> Self {
        self.fail_all_networks = true;
        self
    }

    pub fn with_failing_exec(mut self, name_substring: &str) -> Self {
        self.failing_exec_substring = Some(name_substring.to_string());
        self
    }

    pub fn network_count(&self) -> usize {
        self.state.lock().networks.len()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .containers
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn container_ip(&self, name_or_id: &str) -> Option<Ipv4Addr> {
        self.state
            .lock()
            .containers
            .iter()
            .find(|c| c.name == name_or_id || c.id == name_or_id)
            .and_then(|c| c.ipv4)
    }

    pub fn network_icc_disabled(&self, name: &str) -> Option<bool> {
        self.state.lock().networks.get(name).map(|n| n.icc_disabled)
    }
}

#[cfg(test)]
impl DockerClient for MockDockerClient {
    async fn ping(&self) -> Result<(), EgressError> {
        Ok(())
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>, EgressError> {
        let state = self.state.lock();
        Ok(state
            .networks
            .iter()
            .find(|(n, net)| *n == name || net.id == name)
            .map(|(_, net)| NetworkInfo {
                id: net.id.clone(),
                subnet: Some(net.subnet.clone()),
            }))
    }

    async fn create_network(
        &self,
        name: &str,
        disable_icc: bool,
    ) -> Result<NetworkInfo, EgressError> {
        if self.fail_all_networks {
            return Err(EgressError::NetworkUnavailable(
                "mock network backend down".to_string(),
            ));
        }
        if disable_icc && self.fail_icc_networks {
            return Err(EgressError::NetworkUnavailable(
                "mock host does not support enable_icc=false".to_string(),
            ));
        }

        let mut state = self.state.lock();
        state.next_id += 1;
        let octet = state.next_id;
        let network = MockNetwork {
            id: format!("net-{}", octet),
            subnet: format!("172.{}.0.0/16", 20 + octet),
            icc_disabled: disable_icc,
        };
        let info = NetworkInfo {
            id: network.id.clone(),
            subnet: Some(network.subnet.clone()),
        };
        state.networks.insert(name.to_string(), network);
        Ok(info)
    }

    async fn remove_network(&self, name: &str) -> Result<(), EgressError> {
        let mut state = self.state.lock();
        let Some((net_name, net_id)) = state
            .networks
            .iter()
            .find(|(n, net)| *n == name || net.id == name)
            .map(|(n, net)| (n.clone(), net.id.clone()))
        else {
            return Ok(());
        };

        // Docker refuses to remove a network with attached containers.
        if state.containers.iter().any(|c| {
            c.network.as_deref() == Some(net_name.as_str())
                || c.network.as_deref() == Some(net_id.as_str())
        }) {
            return Err(EgressError::Backend(format!(
                "network '{}' has active endpoints",
                name
            )));
        }

        state.networks.remove(&net_name);
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, EgressError> {
        let mut state = self.state.lock();
        if state.containers.iter().any(|c| c.name == spec.name) {
            return Err(EgressError::Backend(format!(
                "container name '{}' already in use",
                spec.name
            )));
        }
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.containers.push(MockContainer {
            id: id.clone(),
            name: spec.name.clone(),
            network: Some(spec.network.clone()),
            ipv4: spec.ipv4,
        });
        Ok(id)
    }

    async fn remove_container(&self, name: &str) -> Result<(), EgressError> {
        let mut state = self.state.lock();
        state.containers.retain(|c| c.name != name && c.id != name);
        Ok(())
    }

    async fn rename_container(&self, name: &str, new_name: &str) -> Result<(), EgressError> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.name == name || c.id == name)
            .ok_or_else(|| EgressError::Backend(format!("no such container: {}", name)))?;
        container.name = new_name.to_string();
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        ipv4: Option<Ipv4Addr>,
    ) -> Result<(), EgressError> {
        let mut state = self.state.lock();
        let entry = state
            .containers
            .iter_mut()
            .find(|c| c.name == container || c.id == container)
            .ok_or_else(|| EgressError::Backend(format!("no such container: {}", container)))?;
        entry.network = Some(network.to_string());
        entry.ipv4 = ipv4;
        Ok(())
    }

    async fn disconnect_network(&self, _network: &str, container: &str) -> Result<(), EgressError> {
        let mut state = self.state.lock();
        if let Some(entry) = state
            .containers
            .iter_mut()
            .find(|c| c.name == container || c.id == container)
        {
            entry.network = None;
            entry.ipv4 = None;
        }
        Ok(())
    }

    async fn exec(&self, container: &str, _cmd: &[&str]) -> Result<ExecOutput, EgressError> {
        let state = self.state.lock();
        let entry = state
            .containers
            .iter()
            .find(|c| c.name == container || c.id == container)
            .ok_or_else(|| EgressError::Backend(format!("no such container: {}", container)))?;

        let exit_code = match &self.failing_exec_substring {
            Some(sub) if entry.name.contains(sub.as_str()) => 1,
            _ => 0,
        };

        Ok(ExecOutput {
            exit_code,
            stdout: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, network: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "dnsmasq:test".to_string(),
            cmd: vec!["-k".to_string()],
            network: network.to_string(),
            ipv4: Some(Ipv4Addr::new(172, 21, 0, 2)),
            binds: vec![],
        }
    }

    #[tokio::test]
    async fn test_mock_network_lifecycle() {
        let mock = MockDockerClient::new();

        assert!(mock.inspect_network("ert-env1").await.unwrap().is_none());

        let created = mock.create_network("ert-env1", true).await.unwrap();
        assert!(created.subnet.is_some());
        assert_eq!(mock.network_icc_disabled("ert-env1"), Some(true));

        let inspected = mock.inspect_network("ert-env1").await.unwrap().unwrap();
        assert_eq!(inspected, created);

        mock.remove_network("ert-env1").await.unwrap();
        assert_eq!(mock.network_count(), 0);

        // Removing again is fine.
        mock.remove_network("ert-env1").await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_remove_network_rejects_active_endpoints() {
        let mock = MockDockerClient::new();
        let net = mock.create_network("net", false).await.unwrap();
        mock.run_container(&spec("dns", &net.id)).await.unwrap();

        assert!(mock.remove_network("net").await.is_err());

        mock.remove_container("dns").await.unwrap();
        mock.remove_network("net").await.unwrap();
        assert_eq!(mock.network_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_rejects_icc_when_configured() {
        let mock = MockDockerClient::new().with_failing_icc();
        assert!(mock.create_network("n", true).await.is_err());
        assert!(mock.create_network("n", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_container_lifecycle() {
        let mock = MockDockerClient::new();
        mock.create_network("net", false).await.unwrap();

        let id = mock.run_container(&spec("dns", "net")).await.unwrap();
        assert_eq!(mock.container_count(), 1);

        // Duplicate name rejected.
        assert!(mock.run_container(&spec("dns", "net")).await.is_err());

        mock.rename_container(&id, "dns-old").await.unwrap();
        assert_eq!(mock.container_names(), vec!["dns-old"]);

        mock.remove_container("dns-old").await.unwrap();
        assert_eq!(mock.container_count(), 0);
        mock.remove_container("dns-old").await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_exec_honors_failing_substring() {
        let mock = MockDockerClient::new().with_failing_exec("-next");
        mock.create_network("net", false).await.unwrap();
        mock.run_container(&spec("dns", "net")).await.unwrap();
        mock.run_container(&spec("dns-next", "net")).await.unwrap();

        assert!(mock.exec("dns", &["true"]).await.unwrap().success());
        assert!(!mock.exec("dns-next", &["true"]).await.unwrap().success());
    }

    #[tokio::test]
    async fn test_mock_connect_sets_static_address() {
        let mock = MockDockerClient::new();
        mock.create_network("net", false).await.unwrap();
        let id = mock.run_container(&spec("dns", "net")).await.unwrap();

        mock.disconnect_network("net", &id).await.unwrap();
        assert_eq!(mock.container_ip(&id), None);

        let ip = Ipv4Addr::new(172, 21, 0, 2);
        mock.connect_network("net", &id, Some(ip)).await.unwrap();
        assert_eq!(mock.container_ip(&id), Some(ip));
    }
}
