//! rudder-rollout — template replacement under availability constraints.
//!
//! The rollout controller drives a phase machine (Idle → RollingOut →
//! Complete, with Paused, Failed, and graceful abort along the way). Each
//! step it may create new-template instances, bounded by `max_surge`, and
//! retire old-template instances — but only after an equal number of new
//! instances has reached Ready, and never dropping the Ready count below
//! `desired - max_unavailable`.
//!
//! A rollout that misses its deadline fails and rolls back to the prior
//! template automatically; that is a recovered failure, not fatal to the
//! controller.

pub mod controller;
pub mod plan;

pub use controller::{RolloutAction, RolloutController, RolloutError, RolloutPhase, RolloutView};
pub use plan::{surge_count, unavailable_count};
