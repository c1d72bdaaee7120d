//! Control plane — the reconciliation loops and the scale arbiter.
//!
//! The daemon runs three writers against the shared state store: the
//! replica loop (converges the instance set), the rollout loop (drives
//! template replacement), and the autoscaler. Only one of them may move
//! `desired_replicas` at a time; the [`ScaleArbiter`] enforces the
//! precedence rollout > autoscaler > manual override.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use rudder_api::ManualOverride;
use rudder_config::Manifest;
use rudder_health::ProbeMonitor;
use rudder_replicas::{ActionExecutor, ReconcileInput, ReplicaAction, reconcile};
use rudder_rollout::{RolloutAction, RolloutController, RolloutPhase, RolloutView};
use rudder_state::{DesiredState, ProbeSettings, StateError, StateStore};

/// Seconds a manual override holds off autoscaler decisions.
const MANUAL_OVERRIDE_GRACE_SECS: u64 = 60;

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Desired state seeding ──────────────────────────────────────────

/// Reconcile the manifest with whatever desired state survived the last
/// run. Bounds, target, and probe/rollout settings always come from the
/// manifest; the arbitrated replica count and the active template are
/// runtime state and survive restarts (re-clamped into the new bounds).
pub fn seed_desired_state(state: &StateStore, manifest: &Manifest) -> anyhow::Result<DesiredState> {
    let now = epoch_secs();
    match state.get_desired() {
        Ok(mut desired) => {
            let fresh = manifest.into_desired_state(now);
            desired.replicas_min = fresh.replicas_min;
            desired.replicas_max = fresh.replicas_max;
            desired.target_cpu_percent = fresh.target_cpu_percent;
            desired.rollout = fresh.rollout;
            desired.probe = fresh.probe;
            desired.desired_replicas = desired
                .desired_replicas
                .clamp(fresh.replicas_min, fresh.replicas_max);
            desired.updated_at = now;
            state.put_desired(&desired)?;
            info!(
                replicas = desired.desired_replicas,
                template = %desired.template,
                "desired state restored, manifest settings applied"
            );
            Ok(desired)
        }
        Err(StateError::NotFound(_)) => {
            let desired = manifest.into_desired_state(now);
            state.put_desired(&desired)?;
            info!(
                replicas = desired.desired_replicas,
                template = %desired.template,
                "desired state seeded from manifest"
            );
            Ok(desired)
        }
        Err(e) => Err(e.into()),
    }
}

// ── Scale arbiter ──────────────────────────────────────────────────

/// Single gate for autoscaler writes to `desired_replicas`.
///
/// A rollout in flight owns the count outright. A recent manual override
/// holds until its grace period elapses; the first accepted autoscaler
/// decision after that clears it.
pub struct ScaleArbiter {
    state: StateStore,
    rollout: Arc<RwLock<RolloutController>>,
    manual: Arc<RwLock<Option<ManualOverride>>>,
    grace: Duration,
}

impl ScaleArbiter {
    pub fn new(
        state: StateStore,
        rollout: Arc<RwLock<RolloutController>>,
        manual: Arc<RwLock<Option<ManualOverride>>>,
    ) -> Self {
        Self {
            state,
            rollout,
            manual,
            grace: Duration::from_secs(MANUAL_OVERRIDE_GRACE_SECS),
        }
    }

    /// Shrink the override grace period (tests).
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Apply an autoscaler proposal, or explain why it is deferred.
    pub async fn propose_autoscale(&self, target: u32) -> anyhow::Result<()> {
        if self.rollout.read().await.is_active() {
            anyhow::bail!("rollout in progress");
        }

        let now = epoch_secs();
        {
            let mut manual = self.manual.write().await;
            if let Some(m) = *manual {
                let held = now.saturating_sub(m.set_at);
                if held < self.grace.as_secs() {
                    anyhow::bail!(
                        "manual override to {} holds for {}s more",
                        m.replicas,
                        self.grace.as_secs() - held
                    );
                }
                debug!(replicas = m.replicas, "manual override expired");
                *manual = None;
            }
        }

        let mut desired = self.state.get_desired()?;
        let clamped = target.clamp(desired.replicas_min, desired.replicas_max);
        if clamped == desired.desired_replicas {
            return Ok(());
        }
        desired.desired_replicas = clamped;
        desired.updated_at = now;
        self.state.put_desired(&desired)?;
        info!(replicas = clamped, "autoscale applied");
        Ok(())
    }
}

// ── Control plane ──────────────────────────────────────────────────

/// Owns the replica and rollout reconciliation passes.
pub struct ControlPlane {
    state: StateStore,
    executor: ActionExecutor,
    monitor: Arc<ProbeMonitor>,
    rollout: Arc<RwLock<RolloutController>>,
}

impl ControlPlane {
    pub fn new(
        state: StateStore,
        executor: ActionExecutor,
        monitor: Arc<ProbeMonitor>,
        rollout: Arc<RwLock<RolloutController>>,
    ) -> Self {
        Self {
            state,
            executor,
            monitor,
            rollout,
        }
    }

    /// Restart probe loops for instances that survived a daemon restart.
    pub async fn restart_probes(&self) -> anyhow::Result<()> {
        let desired = match self.state.get_desired() {
            Ok(d) => d,
            Err(StateError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let records = self.state.list_instances()?;
        let mut restarted = 0;
        for record in records.iter().filter(|r| r.is_active()) {
            self.monitor
                .start_probe(&record.id, &record.address, &desired.probe)
                .await;
            restarted += 1;
        }
        if restarted > 0 {
            info!(count = restarted, "probe loops restored");
        }
        Ok(())
    }

    /// One replica reconciliation pass.
    ///
    /// While a rollout is active the pass pins the count to the current
    /// active set — convergence belongs to the rollout loop then, and
    /// only Failed-instance replacement happens here.
    pub async fn replica_tick(&self) -> anyhow::Result<()> {
        let desired = match self.state.get_desired() {
            Ok(d) => d,
            Err(StateError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let observed = self.state.list_instances()?;

        let rollout_active = self.rollout.read().await.is_active();
        let (desired_count, ready_floor) = if rollout_active {
            let active = observed.iter().filter(|r| r.is_active()).count() as u32;
            (
                active,
                desired
                    .desired_replicas
                    .saturating_sub(desired.rollout.max_unavailable),
            )
        } else {
            (desired.desired_replicas, 0)
        };

        let actions = reconcile(&ReconcileInput {
            desired_count,
            template: &desired.template,
            observed: &observed,
            ready_floor,
        });
        if actions.is_empty() {
            return Ok(());
        }
        self.apply(actions, &desired.probe).await
    }

    /// One rollout step: decide under the controller lock, apply outside
    /// it so operator commands are not blocked behind scheduler retries.
    pub async fn rollout_tick(&self) -> anyhow::Result<()> {
        let desired = match self.state.get_desired() {
            Ok(d) => d,
            Err(StateError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let observed = self.state.list_instances()?;

        let (actions, phase) = {
            let mut rollout = self.rollout.write().await;
            if !rollout.is_active() {
                return Ok(());
            }
            let view = RolloutView {
                desired_count: desired.desired_replicas,
                instances: &observed,
                now: epoch_secs(),
            };
            let actions = rollout.step(&view);
            (actions, rollout.phase().clone())
        };

        let mut replica_actions = Vec::new();
        for action in actions {
            match action {
                RolloutAction::CreateNew { template } => {
                    replica_actions.push(ReplicaAction::Create { template });
                }
                RolloutAction::RetireOld { instance_id } => {
                    replica_actions.push(ReplicaAction::Delete { instance_id });
                }
                RolloutAction::Rollback { to_template } => {
                    warn!(template = %to_template, "reverting active template");
                    let mut desired = self.state.get_desired()?;
                    desired.template = to_template;
                    desired.updated_at = epoch_secs();
                    self.state.put_desired(&desired)?;
                    self.state.clear_rollout_plan()?;
                }
            }
        }
        if !replica_actions.is_empty() {
            self.apply(replica_actions, &desired.probe).await?;
        }

        match phase {
            RolloutPhase::Complete => {
                self.state.clear_rollout_plan()?;
                self.rollout.write().await.acknowledge();
                info!("rollout complete");
            }
            RolloutPhase::Failed { reason } => {
                warn!(%reason, "rollout failed and rolled back");
                self.rollout.write().await.acknowledge();
            }
            _ => {}
        }
        Ok(())
    }

    /// Apply actions through the executor and keep probe loops in step.
    async fn apply(
        &self,
        actions: Vec<ReplicaAction>,
        probe: &ProbeSettings,
    ) -> anyhow::Result<()> {
        let outcome = self.executor.apply(actions).await?;
        for placed in &outcome.created {
            self.monitor
                .start_probe(&placed.id, &placed.address, probe)
                .await;
        }
        for id in &outcome.deleted {
            self.monitor.stop_probe(id).await;
        }
        Ok(())
    }

    /// Run the replica reconciliation loop until shutdown.
    pub async fn run_replica_loop(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "replica loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.replica_tick().await {
                        tracing::error!(error = %e, "replica reconciliation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("replica loop shutting down");
                    break;
                }
            }
        }
    }

    /// Run the rollout loop until shutdown.
    pub async fn run_rollout_loop(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "rollout loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.rollout_tick().await {
                        tracing::error!(error = %e, "rollout step failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("rollout loop shutting down");
                    break;
                }
            }
        }
    }
}
