use super::{
    ContainerDetails, ContainerRequest, ContainerRuntime, NetworkDetails, NetworkRequest, Result,
    RuntimeError,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerInspectResponse, HostConfig, Ipam, IpamConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use log::debug;
use std::collections::HashMap;

/// Container runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn connect() -> anyhow::Result<Self> {
        // Connect to the local Docker daemon using default settings.
        // This handles unix socket on Linux.
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, label: Option<&str>) -> Result<Vec<String>> {
        let containers = self
            .docker
            .list_containers(Some(list_options(label.map(|l| ("label", l)))))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                c.names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| n.trim_start_matches('/').to_string())
            })
            .collect())
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerDetails>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(detail) => Ok(Some(container_details(name, detail))),
            Err(e) => none_if_missing(e),
        }
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(classify)?;
        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkDetails>> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            // The inspect endpoint map only holds containers with a live
            // sandbox; stopped containers still pin the network.
            Ok(_) => {
                let containers = self
                    .docker
                    .list_containers(Some(list_options(Some(("network", name)))))
                    .await
                    .map_err(classify)?;
                Ok(Some(NetworkDetails {
                    containers: containers.len(),
                }))
            }
            Err(e) => none_if_missing(e),
        }
    }

    async fn create_network(&self, request: &NetworkRequest) -> Result<()> {
        let opts = CreateNetworkOptions::<String> {
            name: request.name.clone(),
            driver: "bridge".to_string(),
            enable_ipv6: request.ipv6,
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(request.subnet.clone()),
                    gateway: Some(request.gateway.clone()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        self.docker.create_network(opts).await.map_err(classify)?;
        debug!("Docker created network {}", request.name);
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker.remove_network(name).await.map_err(classify)
    }

    async fn create_container(&self, request: &ContainerRequest) -> Result<()> {
        let opts = CreateContainerOptions {
            name: request.name.clone(),
            platform: None,
        };
        self.docker
            .create_container(Some(opts), container_config(request))
            .await
            .map_err(classify)?;
        debug!("Docker created container {}", request.name);
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        match self
            .docker
            .stop_container(name, None::<StopContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.docker
            .remove_container(name, None::<RemoveContainerOptions>)
            .await
            .map_err(classify)
    }
}

/// List every container, running or not, optionally narrowed by one filter.
fn list_options(filter: Option<(&str, &str)>) -> ListContainersOptions<String> {
    let filters = filter
        .map(|(key, value)| HashMap::from([(key.to_string(), vec![value.to_string()])]))
        .unwrap_or_default();
    ListContainersOptions {
        all: true,
        filters,
        ..Default::default()
    }
}

fn container_config(request: &ContainerRequest) -> Config<String> {
    let env = request
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>();
    let labels = request
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<HashMap<_, _>>();
    let binds = request.mounts.iter().map(|m| m.to_bind()).collect::<Vec<_>>();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for (container_port, host_port) in &request.published_ports {
        let key = format!("{}/tcp", container_port);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        );
    }

    Config {
        image: Some(request.image.clone()),
        hostname: request.hostname.clone(),
        env: Some(env),
        labels: Some(labels),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(HostConfig {
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                maximum_retry_count: None,
            }),
            binds: (!binds.is_empty()).then_some(binds),
            cap_add: (!request.capabilities.is_empty()).then(|| request.capabilities.clone()),
            network_mode: Some(request.network.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_details(name: &str, detail: ContainerInspectResponse) -> ContainerDetails {
    let networks = detail
        .network_settings
        .and_then(|s| s.networks)
        .map(|n| n.into_keys().collect())
        .unwrap_or_default();
    let (state, started_at) = match detail.state {
        Some(state) => (
            state.status.map(|s| s.to_string()).unwrap_or_default(),
            state.started_at,
        ),
        None => (String::new(), None),
    };

    ContainerDetails {
        name: detail
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| name.to_string()),
        state,
        started_at,
        networks,
    }
}

fn none_if_missing<T>(err: BollardError) -> Result<Option<T>> {
    match classify(err) {
        e if e.kind == super::ErrorKind::NotFound => Ok(None),
        e => Err(e),
    }
}

/// Map a bollard error onto the daemon's transient/rejected split.
fn classify(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::not_found(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } if (400..500).contains(&status_code) => {
            RuntimeError::rejected(format!("{} ({})", message, status_code))
        }
        other => RuntimeError::transient(other.to_string()),
    }
}
