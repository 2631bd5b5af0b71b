//! Mutating actions against the container runtime.
//!
//! Every operation re-checks existence right before acting, so calling it
//! twice leaves the runtime in the same state as calling it once.  Nothing
//! here panics or retries: each call reports an [`Outcome`] or an
//! [`OpError`] and the reconciler decides what to do with it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::credentials::CredentialStore;
use crate::inspector::Inspector;
use crate::net::{Cidr, CidrError};
use crate::runtime::{
    ContainerRequest, ContainerRuntime, ErrorKind, Mount, NetworkRequest, RuntimeError,
};
use crate::types::{MachineSpec, NetworkSpec, PortError};

/// What an operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The object was created and, for containers, started.
    Created,
    /// The object already existed; nothing was done.
    Present,
    Removed,
    /// The object to remove was not there; nothing was done.
    Absent,
    /// Network removal refused because containers are still attached.
    NotEmpty,
}

impl Outcome {
    /// Boolean view: did the operation leave the runtime as requested
    /// by actually finding or changing something?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Created | Self::Present | Self::Removed)
    }
}

#[derive(Debug, Error)]
pub enum OpError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("network {network} has no usable range: {reason}")]
    InvalidRange { network: String, reason: String },

    #[error("network {0} is not declared by the control plane")]
    UnknownNetwork(String),

    #[error("machine {machine} has an unusable owner name: {owner:?}")]
    InvalidOwner { machine: String, owner: String },

    #[error("machine {machine}: {source}")]
    InvalidPort {
        machine: String,
        #[source]
        source: PortError,
    },
}

impl OpError {
    /// True when the runtime could not be reached; the next tick may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Runtime(e) if e.is_transient())
    }
}

pub type Result<T> = std::result::Result<T, OpError>;

/// Fixed shape of every managed machine on this node.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// `key=value` label put on, and used to find, managed containers.
    pub label: String,
    pub companion_suffix: String,
    pub companion_image: String,
    /// Display port the machine's own VNC server listens on.
    pub vnc_port: u16,
    /// Port the companion serves the web display on inside its container.
    pub novnc_internal_port: u16,
    pub homefolder_root: PathBuf,
}

impl FleetSettings {
    pub fn companion_name(&self, machine: &str) -> String {
        format!("{}{}", machine, self.companion_suffix)
    }

    /// Machine name a container belongs to: the container name with the
    /// companion suffix stripped, if present.
    pub fn owning_machine<'a>(&self, container: &'a str) -> &'a str {
        container
            .strip_suffix(self.companion_suffix.as_str())
            .unwrap_or(container)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        let (key, value) = self.label.split_once('=').unwrap_or((self.label.as_str(), ""));
        BTreeMap::from([(key.to_string(), value.to_string())])
    }
}

pub struct Operations<R: ?Sized> {
    runtime: Arc<R>,
    inspector: Inspector<R>,
    credentials: CredentialStore,
    settings: FleetSettings,
}

impl<R: ContainerRuntime + ?Sized> Operations<R> {
    pub fn new(runtime: Arc<R>, credentials: CredentialStore, settings: FleetSettings) -> Self {
        Self {
            inspector: Inspector::new(Arc::clone(&runtime), settings.label.clone()),
            runtime,
            credentials,
            settings,
        }
    }

    pub fn inspector(&self) -> &Inspector<R> {
        &self.inspector
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    /// Create a bridge network for `spec` unless one of that name exists.
    /// The gateway is the first host address of the range.
    pub async fn ensure_network(&self, spec: &NetworkSpec) -> Result<Outcome> {
        if self.inspector.network_exists(&spec.name).await? {
            return Ok(Outcome::Present);
        }

        let cidr = parse_range(spec)?;
        let request = NetworkRequest {
            name: spec.name.clone(),
            subnet: cidr.to_string(),
            gateway: cidr.gateway().to_string(),
            ipv6: cidr.is_ipv6(),
        };

        match self.runtime.create_network(&request).await {
            Ok(()) => {
                info!(
                    "Created network {} ({} via {})",
                    request.name, request.subnet, request.gateway
                );
                Ok(Outcome::Created)
            }
            Err(e) => {
                // Lost a race with another creator.
                if e.kind == ErrorKind::Rejected && self.inspector.network_exists(&spec.name).await? {
                    return Ok(Outcome::Present);
                }
                Err(e.into())
            }
        }
    }

    /// Remove a network only if it exists and nothing is attached to it.
    pub async fn remove_network(&self, name: &str) -> Result<Outcome> {
        if !self.inspector.network_exists(name).await? {
            return Ok(Outcome::Absent);
        }
        let attached = self.inspector.container_count(name).await?;
        if attached > 0 {
            debug!("Network {} still has {} containers", name, attached);
            return Ok(Outcome::NotEmpty);
        }

        match self.runtime.remove_network(name).await {
            Ok(()) => {
                info!("Removed network {}", name);
                Ok(Outcome::Removed)
            }
            Err(e) if e.kind == ErrorKind::NotFound => Ok(Outcome::Absent),
            // Endpoint attached since the count, or a built-in network.
            Err(e) if e.kind == ErrorKind::Rejected => {
                debug!("Network {} not removed: {}", name, e);
                Ok(Outcome::NotEmpty)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create and start the primary container for `spec`, creating its
    /// network first if needed.
    pub async fn ensure_machine(
        &self,
        spec: &MachineSpec,
        networks: &BTreeMap<String, NetworkSpec>,
    ) -> Result<Outcome> {
        if self.inspector.container_exists(&spec.name).await? {
            return Ok(Outcome::Present);
        }
        // The owner becomes a path under the home folder root.
        if !is_plain_name(&spec.owner) {
            return Err(OpError::InvalidOwner {
                machine: spec.name.clone(),
                owner: spec.owner.clone(),
            });
        }
        self.ensure_machine_network(spec, networks).await?;

        let home = self.settings.homefolder_root.join(&spec.owner);
        let request = ContainerRequest {
            name: spec.name.clone(),
            image: spec.image.clone(),
            hostname: Some(self.credentials.hostname(&spec.name)),
            network: spec.network.clone(),
            env: BTreeMap::from([
                ("OWNER".to_string(), spec.owner.clone()),
                ("HASH".to_string(), "NOT IMPLEMENTED YET".to_string()),
            ]),
            labels: self.settings.labels(),
            mounts: vec![
                Mount {
                    host_path: format!("{}/", home.display()),
                    container_path: format!("/home/{}", spec.owner),
                    read_write: true,
                },
                Mount {
                    host_path: format!("{}/", self.credentials.directory(&spec.name).display()),
                    container_path: "/opt/keytabs".to_string(),
                    read_write: true,
                },
            ],
            capabilities: vec!["SYS_NICE".to_string()],
            published_ports: BTreeMap::new(),
        };

        self.create_and_start(&request).await?;
        info!(
            "Started machine {} ({}) for {} on {}",
            spec.name, spec.image, spec.owner, spec.network
        );
        Ok(Outcome::Created)
    }

    /// Create and start the remote-display gateway paired with `spec`.
    pub async fn ensure_display_companion(
        &self,
        spec: &MachineSpec,
        networks: &BTreeMap<String, NetworkSpec>,
    ) -> Result<Outcome> {
        let name = self.settings.companion_name(&spec.name);
        if self.inspector.container_exists(&name).await? {
            return Ok(Outcome::Present);
        }
        let host_port = spec.novnc_port().map_err(|source| OpError::InvalidPort {
            machine: spec.name.clone(),
            source,
        })?;
        self.ensure_machine_network(spec, networks).await?;

        let request = ContainerRequest {
            name: name.clone(),
            image: self.settings.companion_image.clone(),
            hostname: None,
            network: spec.network.clone(),
            env: BTreeMap::from([(
                "VNC_SERVER".to_string(),
                format!("{}:{}", spec.name, self.settings.vnc_port),
            )]),
            labels: self.settings.labels(),
            mounts: Vec::new(),
            capabilities: Vec::new(),
            published_ports: BTreeMap::from([(self.settings.novnc_internal_port, host_port)]),
        };

        self.create_and_start(&request).await?;
        info!("Started display companion {} on port {}", name, host_port);
        Ok(Outcome::Created)
    }

    /// Stop and remove a container, then try to remove each network it was
    /// attached to.  Staged credential material for `name` is deleted
    /// whether or not the teardown succeeded.
    pub async fn remove_machine(&self, name: &str) -> Result<Outcome> {
        if !self.inspector.container_exists(name).await? {
            return Ok(Outcome::Absent);
        }

        let result = self.teardown(name).await;
        if let Err(e) = self.credentials.remove(name).await {
            warn!("Failed to remove credential material for {}: {}", name, e);
        }
        result
    }

    async fn teardown(&self, name: &str) -> Result<Outcome> {
        // Membership is only readable while the container exists.
        let networks = self.inspector.attached_networks_of(name).await?;

        // Gone since the existence check: carry on with network cleanup.
        match self.runtime.stop_container(name).await {
            Ok(()) => {}
            Err(e) if e.kind == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match self.runtime.remove_container(name).await {
            Ok(()) => {}
            Err(e) if e.kind == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("Removed machine {}", name);

        for network in networks {
            match self.remove_network(&network).await {
                Ok(outcome) => debug!("Network {} after removing {}: {:?}", network, name, outcome),
                Err(e) => warn!("Failed to remove network {}: {}", network, e),
            }
        }
        Ok(Outcome::Removed)
    }

    async fn ensure_machine_network(
        &self,
        spec: &MachineSpec,
        networks: &BTreeMap<String, NetworkSpec>,
    ) -> Result<()> {
        if self.inspector.network_exists(&spec.network).await? {
            return Ok(());
        }
        let network = networks
            .get(&spec.network)
            .ok_or_else(|| OpError::UnknownNetwork(spec.network.clone()))?;
        self.ensure_network(network).await?;
        Ok(())
    }

    async fn create_and_start(&self, request: &ContainerRequest) -> Result<()> {
        self.runtime.create_container(request).await?;
        if let Err(e) = self.runtime.start_container(&request.name).await {
            // Never leave a created-but-unstarted container behind: the
            // existence check would treat it as done on the next tick.
            if let Err(cleanup) = self.runtime.remove_container(&request.name).await {
                warn!(
                    "Failed to clean up unstarted container {}: {}",
                    request.name, cleanup
                );
            }
            return Err(e.into());
        }
        Ok(())
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

fn parse_range(spec: &NetworkSpec) -> Result<Cidr> {
    let range = spec.range.as_deref().ok_or_else(|| OpError::InvalidRange {
        network: spec.name.clone(),
        reason: "no range given".to_string(),
    })?;
    range.parse().map_err(|e: CidrError| OpError::InvalidRange {
        network: spec.name.clone(),
        reason: e.to_string(),
    })
}
