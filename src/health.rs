//! Best-effort status reporting to the control plane.
//!
//! Runs independently of the reconciler: it only reads from the runtime and
//! never mutates anything, so a failing report has no effect on convergence.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::fetcher::ControlPlaneClient;
use crate::inspector::Inspector;
use crate::runtime::{ContainerDetails, ContainerRuntime};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthStats {
    pub up: usize,
    pub other: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub state: String,
    pub started_at: Option<String>,
}

/// Body of `POST /api/health`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub stats: HealthStats,
    pub containers: Vec<HealthEntry>,
}

impl HealthReport {
    pub fn from_containers(containers: Vec<ContainerDetails>) -> Self {
        let mut report = Self::default();
        for container in containers {
            if container.state == "running" {
                report.stats.up += 1;
            } else {
                report.stats.other += 1;
            }
            report.containers.push(HealthEntry {
                name: container.name,
                state: container.state,
                started_at: container.started_at,
            });
        }
        report
    }
}

/// Build and send one report.
pub async fn report_once<R: ContainerRuntime + ?Sized>(
    client: &ControlPlaneClient,
    inspector: &Inspector<R>,
) -> anyhow::Result<()> {
    let containers = inspector.managed_container_details().await?;
    let report = HealthReport::from_containers(containers);
    debug!(
        "Health: {} up, {} other",
        report.stats.up, report.stats.other
    );
    let status = client.report_health(&report).await?;
    debug!("Health report accepted with status {}", status);
    Ok(())
}

/// Report forever at `interval`.
pub async fn run_health_loop<R: ContainerRuntime + ?Sized>(
    client: Arc<ControlPlaneClient>,
    inspector: Inspector<R>,
    interval: Duration,
) {
    info!(
        "Starting health reporter every {}s",
        interval.as_secs_f32()
    );
    let mut consecutive_failures = 0u32;
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        timer.tick().await;
        match report_once(&client, &inspector).await {
            Ok(()) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures <= 3 {
                    warn!("Health report failed: {:#}", e);
                } else {
                    error!(
                        "Health report failed {} times in a row: {:#}",
                        consecutive_failures, e
                    );
                }
            }
        }
    }
}
