//! rudder-autoscale — utilization-driven replica scaling.
//!
//! Every evaluation tick the scaler averages CPU utilization across Ready
//! instances over a sliding window, compares it against the configured
//! target, and proposes a new desired replica count bounded by
//! `[replicas_min, replicas_max]` and by asymmetric rate limits: scale-up
//! may at most double the count within 30 seconds, scale-down may at most
//! halve it within 5 minutes.
//!
//! The scaler never writes `desired_replicas` itself — decisions go to
//! the daemon's scale arbiter, which defers them while a rollout is
//! active.

pub mod sampler;
pub mod scaler;
pub mod window;

pub use sampler::{Sampler, SimulatedSource, UtilizationSource};
pub use scaler::{Autoscaler, DecisionCallback, ScaleDecision};
pub use window::{RateLimits, average_since};
