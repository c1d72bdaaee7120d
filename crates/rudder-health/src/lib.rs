//! rudder-health — the health probe evaluator.
//!
//! Issues periodic HTTP probes against each instance's health endpoint
//! and tracks consecutive failures. A probe timeout counts as a failure,
//! not a fatal error; the evaluator itself never terminates on probe
//! failure, only the probed instance is affected. After the configured
//! threshold of consecutive failures an instance is reclassified from
//! transiently failing to Failed, which triggers replacement by the
//! replica controller.

pub mod monitor;
pub mod prober;

pub use monitor::{ProbeMonitor, ReadinessCallback};
pub use prober::{ProbeTracker, http_probe};
