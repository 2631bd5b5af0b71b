//! Low-level access to the local container runtime.
//!
//! [`ContainerRuntime`] is the narrow surface the rest of the daemon talks
//! to: plain list/inspect/create/remove primitives with no policy attached.
//! Idempotency, ordering and cleanup live one level up in
//! [`crate::inspector`] and [`crate::operations`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

pub mod docker;
#[cfg(test)]
pub mod memory;

pub use docker::DockerRuntime;

/// Classifies how the caller should react to a failed runtime call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection refused, timeout, daemon-side 5xx. Retry next tick.
    Transient,
    /// The runtime understood the request and refused it (name conflict,
    /// unknown image, bad parameters).
    Rejected,
    /// The named object does not exist.
    NotFound,
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Attributes of a single container, read by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub name: String,
    /// Runtime state string, e.g. `running`, `exited`, `created`.
    pub state: String,
    pub started_at: Option<String>,
    /// Names of the networks the container is attached to.
    pub networks: Vec<String>,
}

/// Attributes of a single network, read by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDetails {
    /// Number of containers connected to the network, running or stopped.
    pub containers: usize,
}

/// Bridge network with a single IPAM pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub name: String,
    pub subnet: String,
    pub gateway: String,
    /// The subnet is an IPv6 range.
    pub ipv6: bool,
}

/// A host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    pub read_write: bool,
}

impl Mount {
    /// `host:container:mode` as the runtime expects in a bind list.
    pub fn to_bind(&self) -> String {
        let mode = if self.read_write { "rw" } else { "ro" };
        format!("{}:{}:{}", self.host_path, self.container_path, mode)
    }
}

/// Everything needed to create one container. The container is always
/// created with a restart-always policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRequest {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub network: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub capabilities: Vec<String>,
    /// Container TCP port → host port.
    pub published_ports: BTreeMap<u16, u16>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Names of all containers, running or not. When `label` is given
    /// (`key=value` or bare `key`) only matching containers are returned.
    async fn list_containers(&self, label: Option<&str>) -> Result<Vec<String>>;

    /// Inspect a container by name. `Ok(None)` when it does not exist.
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerDetails>>;

    async fn list_networks(&self) -> Result<Vec<String>>;

    /// Inspect a network by name. `Ok(None)` when it does not exist.
    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkDetails>>;

    async fn create_network(&self, request: &NetworkRequest) -> Result<()>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn create_container(&self, request: &ContainerRequest) -> Result<()>;

    async fn start_container(&self, name: &str) -> Result<()>;

    async fn stop_container(&self, name: &str) -> Result<()>;

    async fn remove_container(&self, name: &str) -> Result<()>;
}
