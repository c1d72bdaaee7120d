//! Domain types for the rudder state store.
//!
//! These types represent the persisted state of the controlled instance
//! set: the operator-declared desired state, per-instance records, the
//! utilization sample window, the active rollout plan, and the
//! degraded-status flags. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a pod instance.
pub type InstanceId = String;

/// Identifier for an instance template (a version of the workload).
pub type TemplateId = String;

// ── Desired state ──────────────────────────────────────────────────

/// Operator-declared target configuration for the instance set.
///
/// Owned by the config source; `desired_replicas` is mutated only through
/// the daemon's scale arbiter (rollout > autoscaler > manual override).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesiredState {
    /// Lower bound on replica count. Must be >= 1.
    pub replicas_min: u32,
    /// Upper bound on replica count. Must be >= replicas_min.
    pub replicas_max: u32,
    /// Target average CPU utilization across Ready instances (percent).
    pub target_cpu_percent: f64,
    /// Current desired replica count, always within [min, max].
    pub desired_replicas: u32,
    /// The active instance template.
    pub template: TemplateId,
    /// Rollout bounds and deadline.
    pub rollout: RolloutSettings,
    /// Health probe parameters.
    pub probe: ProbeSettings,
    /// Unix timestamp (seconds) of last update.
    pub updated_at: u64,
}

/// Surge/unavailable bounds and the rollout deadline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutSettings {
    /// Extra instances tolerated above desired during a rollout.
    pub max_surge: u32,
    /// Missing Ready instances tolerated during a rollout.
    pub max_unavailable: u32,
    /// Seconds a rollout may run before it is failed and rolled back.
    pub deadline_secs: u64,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
            deadline_secs: 600,
        }
    }
}

/// Health probe parameters, resolved from the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeSettings {
    /// HTTP path to probe (e.g., "/healthz").
    pub path: String,
    /// Seconds between probes.
    pub period_secs: u64,
    /// Per-probe timeout in milliseconds. A timeout counts as a failure.
    pub timeout_ms: u64,
    /// Seconds to wait after instance creation before the first probe.
    pub initial_delay_secs: u64,
    /// Consecutive failures before the instance is marked Failed.
    pub failure_threshold: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            period_secs: 5,
            timeout_ms: 2000,
            initial_delay_secs: 3,
            failure_threshold: 3,
        }
    }
}

// ── Instances ──────────────────────────────────────────────────────

/// Lifecycle phase of a pod instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    /// Created, not yet confirmed running by the scheduler.
    Pending,
    /// Running but not yet passing readiness probes.
    Running,
    /// Running and passing readiness probes.
    Ready,
    /// Marked for teardown (scale-down or rollout replacement).
    Terminating,
    /// Exceeded the consecutive probe failure threshold.
    Failed,
}

/// Readiness as determined by the probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    NotReady,
    Unknown,
}

/// Outcome of the most recent probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success,
    Failure,
}

/// Persisted state of a single pod instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    /// Template this instance was created from.
    pub template: TemplateId,
    /// Network endpoint (ip:port) the probe loop targets.
    pub address: String,
    pub phase: InstancePhase,
    pub readiness: Readiness,
    /// Result of the most recent probe, if any has run.
    pub last_probe: Option<ProbeOutcome>,
    /// Unix timestamp (seconds) when this instance was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of last state change.
    pub updated_at: u64,
}

impl InstanceRecord {
    /// A fresh Pending record for a newly created instance.
    pub fn pending(id: &str, template: &str, address: &str, now: u64) -> Self {
        Self {
            id: id.to_string(),
            template: template.to_string(),
            address: address.to_string(),
            phase: InstancePhase::Pending,
            readiness: Readiness::Unknown,
            last_probe: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this instance counts toward the Ready total.
    pub fn is_ready(&self) -> bool {
        self.phase == InstancePhase::Ready
    }

    /// Whether this instance still counts toward the observed set
    /// (Terminating and Failed instances are on their way out).
    pub fn is_active(&self) -> bool {
        !matches!(self.phase, InstancePhase::Terminating | InstancePhase::Failed)
    }
}

// ── Rollout plan ───────────────────────────────────────────────────

/// An in-flight template replacement, persisted for the plan's duration
/// and cleared on completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutPlan {
    /// Template being replaced.
    pub old_template: TemplateId,
    /// Template being rolled out.
    pub new_template: TemplateId,
    pub max_surge: u32,
    pub max_unavailable: u32,
    /// Unix timestamp (seconds) when the rollout started.
    pub started_at: u64,
    /// Seconds before the rollout is failed and rolled back.
    pub deadline_secs: u64,
}

impl RolloutPlan {
    /// Whether the rollout deadline has elapsed.
    pub fn deadline_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.started_at) > self.deadline_secs
    }
}

// ── Utilization ────────────────────────────────────────────────────

/// One CPU utilization observation, averaged across Ready instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UtilizationSample {
    /// Unix timestamp (seconds) the sample was taken.
    pub at: u64,
    /// Average CPU utilization percent at that time.
    pub cpu_percent: f64,
}

impl UtilizationSample {
    /// Zero-padded epoch key with a per-second sequence suffix, so redb
    /// iterates samples in time order and two samples taken within the
    /// same second get distinct keys.
    pub fn table_key(&self, seq: u32) -> String {
        format!("{:020}-{:04}", self.at, seq)
    }
}

// ── Status flags ───────────────────────────────────────────────────

/// Degraded-status signal, surfaced whenever reconciliation cannot make
/// progress (e.g. the external scheduler is unreachable). Never silently
/// dropped: it stays set until explicitly cleared on recovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusFlags {
    pub degraded: bool,
    pub reason: Option<String>,
    pub updated_at: u64,
}

impl StatusFlags {
    pub fn degraded(reason: &str, now: u64) -> Self {
        Self {
            degraded: true,
            reason: Some(reason.to_string()),
            updated_at: now,
        }
    }

    pub fn healthy(now: u64) -> Self {
        Self {
            degraded: false,
            reason: None,
            updated_at: now,
        }
    }
}
