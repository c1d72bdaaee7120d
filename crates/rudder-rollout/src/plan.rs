//! Surge/unavailable accounting for an in-flight rollout.
//!
//! The invariants: at every step, `surge_count <= max_surge` and
//! `unavailable_count <= max_unavailable`.

/// Instances above the desired count (extra capacity during a rollout).
pub fn surge_count(desired: u32, active_total: u32) -> u32 {
    active_total.saturating_sub(desired)
}

/// Ready instances missing against the desired count.
pub fn unavailable_count(desired: u32, ready_total: u32) -> u32 {
    desired.saturating_sub(ready_total)
}
