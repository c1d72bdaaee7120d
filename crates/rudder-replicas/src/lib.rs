//! rudder-replicas — the replica controller.
//!
//! Reconciles the observed instance set against the desired count. The
//! decision logic in [`controller`] is pure (instances in, actions out);
//! [`scheduler`] holds the seam to the external cluster scheduler and the
//! executor that applies actions through it, with backoff and a
//! degraded-status flag when the scheduler is unreachable.

pub mod controller;
pub mod scheduler;

pub use controller::{ReconcileInput, ReplicaAction, reconcile};
pub use scheduler::{
    ActionExecutor, ApplyOutcome, FakeScheduler, ScheduledInstance, SchedulerClient,
    SchedulerError,
};
