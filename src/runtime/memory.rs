//! In-memory runtime used by unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    ContainerDetails, ContainerRequest, ContainerRuntime, NetworkDetails, NetworkRequest, Result,
    RuntimeError,
};

#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub request: ContainerRequest,
    pub running: bool,
}

#[derive(Debug, Default)]
struct State {
    containers: BTreeMap<String, MemoryContainer>,
    networks: BTreeMap<String, NetworkRequest>,
    mutations: usize,
    fail_reads: bool,
    reject_images: BTreeSet<String>,
    fail_stop: BTreeSet<String>,
    fail_start: BTreeSet<String>,
    vanish_on_stop: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail with a transient error.
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().unwrap().fail_reads = fail;
    }

    /// Make container creation with this image fail with a rejection.
    pub fn reject_image(&self, image: &str) {
        self.state
            .lock()
            .unwrap()
            .reject_images
            .insert(image.to_string());
    }

    pub fn fail_start(&self, name: &str) {
        self.state.lock().unwrap().fail_start.insert(name.to_string());
    }

    /// Drop the container when it is stopped, as if removed by someone else.
    pub fn vanish_on_stop(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .vanish_on_stop
            .insert(name.to_string());
    }

    pub fn fail_stop(&self, name: &str) {
        self.state.lock().unwrap().fail_stop.insert(name.to_string());
    }

    /// Insert a container directly, creating its network if missing.
    pub fn seed_container(&self, name: &str, network: &str, label: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .networks
            .entry(network.to_string())
            .or_insert_with(|| NetworkRequest {
                name: network.to_string(),
                subnet: String::new(),
                gateway: String::new(),
                ipv6: false,
            });
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        state.containers.insert(
            name.to_string(),
            MemoryContainer {
                request: ContainerRequest {
                    name: name.to_string(),
                    image: "seeded".to_string(),
                    network: network.to_string(),
                    labels: BTreeMap::from([(key.to_string(), value.to_string())]),
                    ..Default::default()
                },
                running: true,
            },
        );
    }

    pub fn seed_network(&self, name: &str) {
        self.state.lock().unwrap().networks.insert(
            name.to_string(),
            NetworkRequest {
                name: name.to_string(),
                subnet: String::new(),
                gateway: String::new(),
                ipv6: false,
            },
        );
    }

    pub fn container_names(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn network_names(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().networks.keys().cloned().collect()
    }

    pub fn container(&self, name: &str) -> Option<MemoryContainer> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn network(&self, name: &str) -> Option<NetworkRequest> {
        self.state.lock().unwrap().networks.get(name).cloned()
    }

    /// Number of successful mutating calls so far.
    pub fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }
}

fn matches_label(request: &ContainerRequest, label: &str) -> bool {
    match label.split_once('=') {
        Some((key, value)) => request.labels.get(key).is_some_and(|v| v == value),
        None => request.labels.contains_key(label),
    }
}

fn check_reads(state: &State) -> Result<()> {
    if state.fail_reads {
        return Err(RuntimeError::transient("runtime unavailable"));
    }
    Ok(())
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn list_containers(&self, label: Option<&str>) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        check_reads(&state)?;
        Ok(state
            .containers
            .values()
            .filter(|c| label.map_or(true, |l| matches_label(&c.request, l)))
            .map(|c| c.request.name.clone())
            .collect())
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerDetails>> {
        let state = self.state.lock().unwrap();
        check_reads(&state)?;
        Ok(state.containers.get(name).map(|c| ContainerDetails {
            name: name.to_string(),
            state: if c.running { "running" } else { "exited" }.to_string(),
            started_at: c.running.then(|| "2026-01-01T00:00:00Z".to_string()),
            networks: vec![c.request.network.clone()],
        }))
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        check_reads(&state)?;
        Ok(state.networks.keys().cloned().collect())
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkDetails>> {
        let state = self.state.lock().unwrap();
        check_reads(&state)?;
        if !state.networks.contains_key(name) {
            return Ok(None);
        }
        let containers = state
            .containers
            .values()
            .filter(|c| c.request.network == name)
            .count();
        Ok(Some(NetworkDetails {
            containers,
        }))
    }

    async fn create_network(&self, request: &NetworkRequest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.networks.contains_key(&request.name) {
            return Err(RuntimeError::rejected(format!(
                "network {} already exists",
                request.name
            )));
        }
        state.networks.insert(request.name.clone(), request.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.containers.values().any(|c| c.request.network == name) {
            return Err(RuntimeError::rejected(format!("network {} has active endpoints", name)));
        }
        state
            .networks
            .remove(name)
            .ok_or_else(|| RuntimeError::not_found(format!("network {}", name)))?;
        state.mutations += 1;
        Ok(())
    }

    async fn create_container(&self, request: &ContainerRequest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(&request.name) {
            return Err(RuntimeError::rejected(format!(
                "container name {} already in use",
                request.name
            )));
        }
        if state.reject_images.contains(&request.image) {
            return Err(RuntimeError::rejected(format!("no such image: {}", request.image)));
        }
        if !state.networks.contains_key(&request.network) {
            return Err(RuntimeError::not_found(format!("network {}", request.network)));
        }
        state.containers.insert(
            request.name.clone(),
            MemoryContainer {
                request: request.clone(),
                running: false,
            },
        );
        state.mutations += 1;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_start.contains(name) {
            return Err(RuntimeError::rejected(format!("cannot start {}", name)));
        }
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::not_found(format!("container {}", name)))?;
        container.running = true;
        state.mutations += 1;
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_stop.contains(name) {
            return Err(RuntimeError::transient(format!("timeout stopping {}", name)));
        }
        if state.vanish_on_stop.contains(name) {
            state.containers.remove(name);
        }
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::not_found(format!("container {}", name)))?;
        container.running = false;
        state.mutations += 1;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .containers
            .remove(name)
            .ok_or_else(|| RuntimeError::not_found(format!("container {}", name)))?;
        state.mutations += 1;
        Ok(())
    }
}
