//! Read-only queries against the container runtime.
//!
//! Every query goes to the runtime; nothing is cached between calls.
//! Errors are passed through so callers can tell "none" from "unknown".

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::runtime::{ContainerDetails, ContainerRuntime, Result};

/// What is on the host right now, read fresh every tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActualState {
    pub containers: BTreeSet<String>,
    pub networks: BTreeSet<String>,
}

pub struct Inspector<R: ?Sized> {
    runtime: Arc<R>,
    label: String,
}

impl<R: ContainerRuntime + ?Sized> Inspector<R> {
    pub fn new(runtime: Arc<R>, label: impl Into<String>) -> Self {
        Self {
            runtime,
            label: label.into(),
        }
    }

    /// Names of all managed containers, running or stopped.
    pub async fn list_managed_containers(&self) -> Result<BTreeSet<String>> {
        let containers = self.runtime.list_containers(Some(self.label.as_str())).await?;
        Ok(containers.into_iter().collect())
    }

    /// Managed containers and all networks.
    pub async fn observe(&self) -> Result<ActualState> {
        let containers = self.list_managed_containers().await?;
        let networks = self.runtime.list_networks().await?.into_iter().collect();
        Ok(ActualState {
            containers,
            networks,
        })
    }

    /// Details of every managed container, for status reporting.
    pub async fn managed_container_details(&self) -> Result<Vec<ContainerDetails>> {
        let names = self.list_managed_containers().await?;
        let lookups = names.iter().map(|name| self.runtime.inspect_container(name));
        let details = futures_util::future::join_all(lookups).await;

        let mut out = Vec::with_capacity(details.len());
        for detail in details {
            // Removed between list and inspect: skip.
            if let Some(detail) = detail? {
                out.push(detail);
            }
        }
        Ok(out)
    }

    pub async fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self.runtime.inspect_network(name).await?.is_some())
    }

    pub async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.runtime.inspect_container(name).await?.is_some())
    }

    /// Networks `name` is attached to; empty if the container is gone.
    pub async fn attached_networks_of(&self, name: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .runtime
            .inspect_container(name)
            .await?
            .map(|d| d.networks.into_iter().collect())
            .unwrap_or_default())
    }

    /// Containers attached to `network`; zero if the network is gone.
    pub async fn container_count(&self, network: &str) -> Result<usize> {
        Ok(self
            .runtime
            .inspect_network(network)
            .await?
            .map(|n| n.containers)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory::MemoryRuntime;

    const LABEL: &str = "se.domain.app-type=user";

    fn setup() -> (Arc<MemoryRuntime>, Inspector<MemoryRuntime>) {
        let runtime = Arc::new(MemoryRuntime::new());
        let inspector = Inspector::new(Arc::clone(&runtime), LABEL);
        (runtime, inspector)
    }

    #[tokio::test]
    async fn lists_only_labelled_containers() {
        let (runtime, inspector) = setup();
        runtime.seed_container("desk1", "net-a", LABEL);
        runtime.seed_container("desk1_novnc", "net-a", LABEL);
        runtime.seed_container("unrelated", "bridge", "other=thing");

        let names = inspector.list_managed_containers().await.unwrap();
        assert_eq!(
            names,
            BTreeSet::from(["desk1".to_string(), "desk1_novnc".to_string()])
        );

        let actual = inspector.observe().await.unwrap();
        assert_eq!(actual.containers, names);
        assert_eq!(
            actual.networks,
            BTreeSet::from(["bridge".to_string(), "net-a".to_string()])
        );
    }

    #[tokio::test]
    async fn reports_existence_and_membership() {
        let (runtime, inspector) = setup();
        runtime.seed_container("desk1", "net-a", LABEL);
        runtime.seed_network("net-b");

        assert!(inspector.container_exists("desk1").await.unwrap());
        assert!(!inspector.container_exists("desk2").await.unwrap());
        assert!(inspector.network_exists("net-b").await.unwrap());
        assert!(!inspector.network_exists("net-c").await.unwrap());
        assert_eq!(
            inspector.attached_networks_of("desk1").await.unwrap(),
            BTreeSet::from(["net-a".to_string()])
        );
        assert_eq!(inspector.container_count("net-a").await.unwrap(), 1);
        assert_eq!(inspector.container_count("net-b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_failures_are_not_emptiness() {
        let (runtime, inspector) = setup();
        runtime.seed_container("desk1", "net-a", LABEL);
        runtime.fail_reads(true);

        let err = inspector.list_managed_containers().await.unwrap_err();
        assert!(err.is_transient());
        assert!(inspector.container_count("net-a").await.is_err());
        assert!(inspector.observe().await.is_err());
    }

    #[tokio::test]
    async fn collects_details_for_status() {
        let (runtime, inspector) = setup();
        runtime.seed_container("desk1", "net-a", LABEL);

        let details = inspector.managed_container_details().await.unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].state, "running");
        assert!(details[0].started_at.is_some());
    }
}
