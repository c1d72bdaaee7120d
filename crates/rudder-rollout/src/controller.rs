//! Rollout controller — drives the rollout phase machine.
//!
//! The controller is deliberately pure at the deciding edge: `step()`
//! takes a snapshot of the instance set and returns actions; applying
//! them (and reverting the active template on rollback) is the daemon's
//! job.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use rudder_state::{InstanceRecord, RolloutPlan, RolloutSettings, TemplateId};

use crate::plan::{surge_count, unavailable_count};

/// Current phase of the rollout controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RolloutPhase {
    /// No rollout in flight.
    Idle,
    /// Replacing old-template instances with new ones.
    RollingOut,
    /// Halted by operator; resume or abort to leave.
    Paused,
    /// Operator abort accepted; the next step drains in-flight instances.
    Aborting,
    /// Deadline elapsed; rollback has been issued.
    Failed { reason: String },
    /// All old instances terminated, all new instances Ready.
    Complete,
}

/// Errors from operator commands.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("a rollout is already in progress")]
    AlreadyActive,

    #[error("no rollout in progress")]
    NotActive,
}

/// Action emitted by one rollout step, applied by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutAction {
    /// Create a surge instance from the new template.
    CreateNew { template: TemplateId },
    /// Terminate an old-template instance whose replacement is Ready.
    RetireOld { instance_id: String },
    /// Revert the active template (deadline missed).
    Rollback { to_template: TemplateId },
}

/// Snapshot of the world a step decides against.
#[derive(Debug)]
pub struct RolloutView<'a> {
    /// Arbitrated desired replica count.
    pub desired_count: u32,
    /// The observed instance set.
    pub instances: &'a [InstanceRecord],
    /// Unix timestamp (seconds).
    pub now: u64,
}

/// The rollout state machine.
pub struct RolloutController {
    phase: RolloutPhase,
    plan: Option<RolloutPlan>,
    /// Old instances retired so far; retirement may never outrun the
    /// number of new instances that reached Ready.
    retired: u32,
}

impl RolloutController {
    pub fn new() -> Self {
        Self {
            phase: RolloutPhase::Idle,
            plan: None,
            retired: 0,
        }
    }

    /// Restore a controller from a plan that survived a daemon restart.
    pub fn resume_from(plan: RolloutPlan) -> Self {
        Self {
            phase: RolloutPhase::RollingOut,
            plan: Some(plan),
            retired: 0,
        }
    }

    pub fn phase(&self) -> &RolloutPhase {
        &self.phase
    }

    pub fn plan(&self) -> Option<&RolloutPlan> {
        self.plan.as_ref()
    }

    /// Whether the controller currently owns the desired count.
    pub fn is_active(&self) -> bool {
        matches!(
            self.phase,
            RolloutPhase::RollingOut | RolloutPhase::Paused | RolloutPhase::Aborting
        )
    }

    /// Begin replacing `old_template` with `new_template`.
    pub fn start(
        &mut self,
        old_template: &str,
        new_template: &str,
        settings: &RolloutSettings,
        now: u64,
    ) -> Result<&RolloutPlan, RolloutError> {
        if self.is_active() {
            return Err(RolloutError::AlreadyActive);
        }
        let plan = RolloutPlan {
            old_template: old_template.to_string(),
            new_template: new_template.to_string(),
            max_surge: settings.max_surge,
            max_unavailable: settings.max_unavailable,
            started_at: now,
            deadline_secs: settings.deadline_secs,
        };
        info!(
            old = %plan.old_template,
            new = %plan.new_template,
            max_surge = plan.max_surge,
            max_unavailable = plan.max_unavailable,
            "rollout started"
        );
        self.phase = RolloutPhase::RollingOut;
        self.retired = 0;
        Ok(self.plan.insert(plan))
    }

    /// Advance the rollout by one step against the given view.
    ///
    /// Returns no actions while Idle, Paused, Complete, or Failed.
    pub fn step(&mut self, view: &RolloutView) -> Vec<RolloutAction> {
        if self.phase == RolloutPhase::Aborting {
            return self.drain(view);
        }
        if self.phase != RolloutPhase::RollingOut {
            return Vec::new();
        }
        let Some(plan) = self.plan.clone() else {
            return Vec::new();
        };

        // Deadline first: a stuck rollout rolls back rather than hanging.
        if plan.deadline_expired(view.now) {
            warn!(
                elapsed = view.now.saturating_sub(plan.started_at),
                deadline = plan.deadline_secs,
                "rollout deadline elapsed, rolling back"
            );
            self.phase = RolloutPhase::Failed {
                reason: format!("deadline of {}s elapsed", plan.deadline_secs),
            };
            let mut actions = vec![RolloutAction::Rollback {
                to_template: plan.old_template.clone(),
            }];
            // Surge instances of the abandoned template are drained.
            for record in view
                .instances
                .iter()
                .filter(|r| r.is_active() && r.template == plan.new_template)
            {
                actions.push(RolloutAction::RetireOld {
                    instance_id: record.id.clone(),
                });
            }
            return actions;
        }

        let old: Vec<&InstanceRecord> = view
            .instances
            .iter()
            .filter(|r| r.is_active() && r.template == plan.old_template)
            .collect();
        let new: Vec<&InstanceRecord> = view
            .instances
            .iter()
            .filter(|r| r.is_active() && r.template == plan.new_template)
            .collect();

        let new_ready = new.iter().filter(|r| r.is_ready()).count() as u32;
        let ready_total = new_ready + old.iter().filter(|r| r.is_ready()).count() as u32;
        let active_total = (old.len() + new.len()) as u32;

        // Done: nothing old remains and the new set is fully Ready.
        if old.is_empty() && new.len() as u32 >= view.desired_count && new_ready >= view.desired_count {
            info!(new_ready, "rollout complete");
            self.phase = RolloutPhase::Complete;
            return Vec::new();
        }

        let mut actions = Vec::new();

        // Surge: create new-template instances up to desired + max_surge.
        let surge_budget = (view.desired_count + plan.max_surge).saturating_sub(active_total);
        let still_needed = view.desired_count.saturating_sub(new.len() as u32);
        for _ in 0..surge_budget.min(still_needed) {
            actions.push(RolloutAction::CreateNew {
                template: plan.new_template.clone(),
            });
        }

        // Retire: oldest old instances first, one per Ready replacement,
        // and never dropping Ready below desired - max_unavailable.
        let floor = view.desired_count.saturating_sub(plan.max_unavailable);
        let mut matched_budget = new_ready.saturating_sub(self.retired);
        let mut ready_remaining = ready_total;
        for record in &old {
            if matched_budget == 0 {
                break;
            }
            if record.is_ready() {
                if ready_remaining <= floor {
                    continue;
                }
                ready_remaining -= 1;
            }
            actions.push(RolloutAction::RetireOld {
                instance_id: record.id.clone(),
            });
            self.retired += 1;
            matched_budget -= 1;
        }

        debug!(
            old = old.len(),
            new = new.len(),
            new_ready,
            surge = surge_count(view.desired_count, active_total),
            unavailable = unavailable_count(view.desired_count, ready_total),
            actions = actions.len(),
            "rollout step"
        );
        actions
    }

    /// Pause the rollout; `step()` emits nothing until resumed.
    pub fn pause(&mut self) -> Result<(), RolloutError> {
        if self.phase != RolloutPhase::RollingOut {
            return Err(RolloutError::NotActive);
        }
        info!("rollout paused");
        self.phase = RolloutPhase::Paused;
        Ok(())
    }

    /// Resume a paused rollout.
    pub fn resume(&mut self) -> Result<(), RolloutError> {
        if self.phase != RolloutPhase::Paused {
            return Err(RolloutError::NotActive);
        }
        info!("rollout resumed");
        self.phase = RolloutPhase::RollingOut;
        Ok(())
    }

    /// Request a graceful abort: surge creation stops immediately, and
    /// the next `step()` drains new instances that are not yet Ready.
    /// Old instances are never force-terminated; Ready new instances are
    /// left for the replica controller to wind down once the template
    /// reverts.
    pub fn abort(&mut self) -> Result<(), RolloutError> {
        if !matches!(self.phase, RolloutPhase::RollingOut | RolloutPhase::Paused) {
            return Err(RolloutError::NotActive);
        }
        info!("rollout abort requested");
        self.phase = RolloutPhase::Aborting;
        Ok(())
    }

    /// Emit the abort drain actions and return to Idle.
    fn drain(&mut self, view: &RolloutView) -> Vec<RolloutAction> {
        let Some(plan) = self.plan.take() else {
            self.phase = RolloutPhase::Idle;
            return Vec::new();
        };

        let mut actions = vec![RolloutAction::Rollback {
            to_template: plan.old_template.clone(),
        }];
        for record in view.instances.iter().filter(|r| {
            r.is_active() && r.template == plan.new_template && !r.is_ready()
        }) {
            actions.push(RolloutAction::RetireOld {
                instance_id: record.id.clone(),
            });
        }

        info!(drained = actions.len() - 1, "rollout aborted");
        self.phase = RolloutPhase::Idle;
        self.retired = 0;
        actions
    }

    /// Clear a finished rollout (Complete or Failed) back to Idle.
    pub fn acknowledge(&mut self) {
        if matches!(self.phase, RolloutPhase::Complete | RolloutPhase::Failed { .. }) {
            self.phase = RolloutPhase::Idle;
            self.plan = None;
            self.retired = 0;
        }
    }
}

impl Default for RolloutController {
    fn default() -> Self {
        Self::new()
    }
}
