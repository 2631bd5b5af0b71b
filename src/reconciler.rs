//! Reconciliation loop for converging local containers to desired state.
//!
//! Each tick runs three phases in a fixed order:
//!
//! 1. **Fetch**: read networks and machines from the control plane.  If
//!    either read fails the tick ends here and the previous snapshot stays
//!    in effect; nothing on the runtime is touched.
//! 2. **Converge up**: for every desired machine, ensure the primary
//!    container (which ensures its network first), then its display
//!    companion.
//! 3. **Converge down**: remove every managed container whose name, with or
//!    without the companion suffix, is not a desired machine.  Networks are
//!    only ever removed as a side effect of removing their last container.
//!
//! Every operation re-checks existence before acting, so a repeated or
//! missed tick cannot leave the runtime in a worse state.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{debug, info, warn};
use thiserror::Error;

use crate::fetcher::{ApiError, DesiredStateSource};
use crate::operations::{OpError, Operations, Outcome};
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::types::{DesiredState, MachineSpec};

#[derive(Debug, Error)]
pub enum TickError {
    /// Desired state could not be read; the tick made no changes.
    #[error("desired state unavailable: {0}")]
    Fetch(#[from] ApiError),

    /// Actual state could not be read; converge-down was skipped.
    #[error("runtime state unavailable: {0}")]
    Inspect(#[from] RuntimeError),
}

/// What one tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub created: Vec<String>,
    pub removed: Vec<String>,
    /// Container name and the reason it could not be converged.
    pub failed: Vec<(String, String)>,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }

    fn record(&mut self, name: String, result: Result<Outcome, OpError>) {
        match result {
            Ok(Outcome::Created) => self.created.push(name),
            Ok(Outcome::Removed) => self.removed.push(name),
            Ok(outcome) if outcome.is_success() => debug!("{}: {:?}", name, outcome),
            Ok(outcome) => debug!("{}: nothing to do ({:?})", name, outcome),
            Err(e) => {
                if e.is_transient() {
                    warn!("Runtime unavailable for {}, retrying next tick: {}", name, e);
                } else {
                    warn!("Failed to converge {}: {}", name, e);
                }
                self.failed.push((name, e.to_string()));
            }
        }
    }
}

pub struct Reconciler<R: ?Sized, S: ?Sized> {
    source: Arc<S>,
    operations: Operations<R>,
    /// Last desired state that was read in full.
    expected: ArcSwap<DesiredState>,
    tick_interval: Duration,
}

impl<R, S> Reconciler<R, S>
where
    R: ContainerRuntime + ?Sized,
    S: DesiredStateSource + ?Sized,
{
    pub fn new(source: Arc<S>, operations: Operations<R>, tick_interval: Duration) -> Self {
        Self {
            source,
            operations,
            expected: ArcSwap::from_pointee(DesiredState::default()),
            tick_interval,
        }
    }

    /// The current expected snapshot.  Never partially updated.
    pub fn expected(&self) -> Arc<DesiredState> {
        self.expected.load_full()
    }

    /// Tick forever.  Safe to abort at any point between ticks.
    pub async fn run(&self) {
        info!(
            "Starting reconciliation loop every {}s",
            self.tick_interval.as_secs_f32()
        );
        loop {
            match self.tick().await {
                Ok(report) if report.is_quiet() => debug!(
                    "Tick: {} machines converged",
                    self.expected().machines.len()
                ),
                Ok(report) => info!(
                    "Tick: {} created, {} removed, {} failed",
                    report.created.len(),
                    report.removed.len(),
                    report.failed.len()
                ),
                Err(TickError::Fetch(e)) => {
                    warn!("Skipping tick, not touching any machine: {}", e)
                }
                Err(e) => warn!("Tick aborted: {}", e),
            }
            tokio::time::sleep(self.tick_interval).await;
        }
    }

    /// One full fetch, converge-up, converge-down pass.
    pub async fn tick(&self) -> Result<TickReport, TickError> {
        let desired = self.refresh().await?;
        let mut report = TickReport::default();
        self.converge_up(&desired, &mut report).await;
        self.converge_down(&desired, &mut report).await?;
        Ok(report)
    }

    /// Fetch both halves of the desired state and swap the snapshot in only
    /// if both succeeded.
    pub async fn refresh(&self) -> Result<Arc<DesiredState>, ApiError> {
        let (networks, machines) = tokio::try_join!(
            self.source.fetch_networks(),
            self.source.fetch_machines()
        )?;
        let desired = Arc::new(DesiredState::new(networks, machines));
        if !desired.quarantined.is_empty() {
            warn!(
                "Leaving {} malformed machines untouched: {:?}",
                desired.quarantined.len(),
                desired.quarantined
            );
        }
        self.expected.store(Arc::clone(&desired));
        Ok(desired)
    }

    pub async fn converge_up(&self, desired: &DesiredState, report: &mut TickReport) {
        for machine in desired.machines.values() {
            self.converge_machine(machine, desired, report).await;
        }
    }

    async fn converge_machine(
        &self,
        machine: &MachineSpec,
        desired: &DesiredState,
        report: &mut TickReport,
    ) {
        let result = self
            .operations
            .ensure_machine(machine, &desired.networks)
            .await;
        report.record(machine.name.clone(), result);

        let companion = self.operations.settings().companion_name(&machine.name);
        let result = self
            .operations
            .ensure_display_companion(machine, &desired.networks)
            .await;
        report.record(companion, result);
    }

    /// Remove managed containers that belong to no desired machine.
    ///
    /// A failed listing aborts the phase: an unreadable runtime is not an
    /// empty one.
    pub async fn converge_down(
        &self,
        desired: &DesiredState,
        report: &mut TickReport,
    ) -> Result<(), RuntimeError> {
        let actual = self.operations.inspector().observe().await?;
        debug!(
            "Observed {} managed containers, {} networks",
            actual.containers.len(),
            actual.networks.len()
        );
        let settings = self.operations.settings();

        for name in actual.containers {
            if desired.expects(&name) || desired.expects(settings.owning_machine(&name)) {
                continue;
            }
            info!("Removing machine {}", name);
            let result = self.operations.remove_machine(&name).await;
            report.record(name, result);
        }
        Ok(())
    }
}
