//! The autoscaler evaluation loop.
//!
//! Reads the utilization window and the Ready instance count from the
//! state store, proposes a new desired count, and hands the decision to
//! a callback (the daemon's scale arbiter).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use rudder_state::{DesiredState, StateResult, StateStore};

use crate::window::{RateLimits, average_since};

/// A scaling decision for the instance set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Propose the given desired replica count.
    ScaleTo(u32),
    /// No change warranted this tick.
    Hold,
}

/// Callback type for delivering scale decisions to the arbiter.
pub type DecisionCallback = Box<dyn Fn(u32) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>;

/// Utilization-driven scaler with asymmetric rate limits.
pub struct Autoscaler {
    state: StateStore,
    /// Sliding window over which utilization is averaged.
    window: Duration,
    limits: RateLimits,
    /// Callback that applies accepted decisions.
    decision_fn: Option<DecisionCallback>,
}

impl Autoscaler {
    pub fn new(state: StateStore, window: Duration) -> Self {
        Self {
            state,
            window,
            limits: RateLimits::new(),
            decision_fn: None,
        }
    }

    /// Set the callback used to deliver `ScaleTo` decisions.
    pub fn with_decision_fn(mut self, f: DecisionCallback) -> Self {
        self.decision_fn = Some(f);
        self
    }

    /// Override the rate-limit windows (tests compress them).
    pub fn with_limits(mut self, limits: RateLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Evaluate one tick against the given desired state.
    ///
    /// `ready_count` is the number of Ready instances; with zero the
    /// utilization average is undefined, so the scaler holds at the
    /// configured minimum instead of dividing by zero.
    pub fn evaluate(
        &mut self,
        desired: &DesiredState,
        ready_count: u32,
        now: u64,
    ) -> StateResult<ScaleDecision> {
        let current = desired.desired_replicas;

        if ready_count == 0 {
            warn!("no ready instances, holding at minimum replica count");
            return Ok(if current != desired.replicas_min {
                ScaleDecision::ScaleTo(desired.replicas_min)
            } else {
                ScaleDecision::Hold
            });
        }

        let since = now.saturating_sub(self.window.as_secs());
        let samples = self.state.list_samples_since(since)?;
        let Some(average) = average_since(&samples, since) else {
            debug!("utilization window empty, holding");
            return Ok(ScaleDecision::Hold);
        };

        let target = desired.target_cpu_percent;

        // Deadband: within 10% of target, do nothing.
        if average > target * 0.9 && average < target * 1.1 {
            return Ok(ScaleDecision::Hold);
        }

        let raw = ((f64::from(current)) * average / target).ceil() as u32;
        let clamped = raw.clamp(desired.replicas_min, desired.replicas_max);
        let allowed = self.limits.clamp(now, current, clamped);

        if allowed == current {
            return Ok(ScaleDecision::Hold);
        }

        debug!(
            from = current,
            to = allowed,
            average,
            target,
            "proposing scale"
        );
        Ok(ScaleDecision::ScaleTo(allowed))
    }

    /// Evaluate one tick from the store and deliver any decision.
    pub async fn evaluate_tick(&mut self) -> anyhow::Result<ScaleDecision> {
        let now = epoch_secs();
        let desired = self.state.get_desired()?;
        let ready_count = self
            .state
            .list_instances()?
            .iter()
            .filter(|r| r.is_ready())
            .count() as u32;

        // Keep the stored window bounded.
        let _ = self
            .state
            .prune_samples_before(now.saturating_sub(self.window.as_secs() * 2));

        let decision = self.evaluate(&desired, ready_count, now)?;

        if let ScaleDecision::ScaleTo(target) = decision
            && let Some(ref decision_fn) = self.decision_fn
            && let Err(e) = decision_fn(target).await
        {
            warn!(target, error = %e, "scale decision rejected");
        }

        Ok(decision)
    }

    /// Run the autoscaler loop.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.evaluate_tick().await {
                        tracing::error!(error = %e, "autoscaler evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
