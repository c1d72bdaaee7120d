//! Reconciliation logic — desired count vs. observed instance set.
//!
//! `reconcile()` is a pure function: it never talks to the scheduler or
//! the store, it only decides. Calling it twice with unchanged inputs
//! yields the same actions; once the actions have been applied and the
//! observed set matches the desired count, it yields none.

use tracing::debug;

use rudder_state::{InstancePhase, InstanceRecord};

/// An action for the external scheduler, emitted by `reconcile()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaAction {
    /// Create a new instance from the given template.
    Create { template: String },
    /// Tear down an existing instance.
    Delete { instance_id: String },
}

/// Inputs to one reconciliation pass.
#[derive(Debug)]
pub struct ReconcileInput<'a> {
    /// Desired replica count (already arbitrated and clamped).
    pub desired_count: u32,
    /// Template for any instances created this pass.
    pub template: &'a str,
    /// The observed instance set, oldest first.
    pub observed: &'a [InstanceRecord],
    /// Minimum Ready instances that must survive this pass. During a
    /// rollout this is `desired_count - max_unavailable`; otherwise 0.
    pub ready_floor: u32,
}

/// Compute the create/delete actions that converge the observed set
/// toward the desired count.
///
/// Lingering Terminating records get their delete re-issued. Failed
/// instances are replaced — exactly one delete and one create each,
/// never a cascade. Scale-down removes the oldest instances first,
/// skipping any Ready instance whose removal would drop the Ready count
/// below the floor (those wait for a later pass).
pub fn reconcile(input: &ReconcileInput) -> Vec<ReplicaAction> {
    let mut actions = Vec::new();

    // A Terminating record is a delete that never finished (scheduler
    // unreachable mid-apply, or a restart between the mark and the
    // teardown). Re-issue the delete; scheduler deletes are idempotent.
    for lingering in input
        .observed
        .iter()
        .filter(|r| r.phase == InstancePhase::Terminating)
    {
        actions.push(ReplicaAction::Delete {
            instance_id: lingering.id.clone(),
        });
    }

    // Failed instances: one replacement each.
    for failed in input
        .observed
        .iter()
        .filter(|r| r.phase == InstancePhase::Failed)
    {
        actions.push(ReplicaAction::Delete {
            instance_id: failed.id.clone(),
        });
        actions.push(ReplicaAction::Create {
            template: failed.template.clone(),
        });
    }

    let active: Vec<&InstanceRecord> =
        input.observed.iter().filter(|r| r.is_active()).collect();
    let active_count = active.len() as u32;

    if active_count < input.desired_count {
        let missing = input.desired_count - active_count;
        debug!(observed = active_count, desired = input.desired_count, missing, "scaling up");
        for _ in 0..missing {
            actions.push(ReplicaAction::Create {
                template: input.template.to_string(),
            });
        }
    } else if active_count > input.desired_count {
        let mut excess = active_count - input.desired_count;
        let mut ready_remaining = active.iter().filter(|r| r.is_ready()).count() as u32;
        debug!(observed = active_count, desired = input.desired_count, excess, "scaling down");

        // Oldest first; `observed` is already in creation order.
        for record in &active {
            if excess == 0 {
                break;
            }
            if record.is_ready() {
                if ready_remaining <= input.ready_floor {
                    // Removing this one would violate the availability
                    // floor; leave it for a later pass.
                    continue;
                }
                ready_remaining -= 1;
            }
            actions.push(ReplicaAction::Delete {
                instance_id: record.id.clone(),
            });
            excess -= 1;
        }
    }

    actions
}
