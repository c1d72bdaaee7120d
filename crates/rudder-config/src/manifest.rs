//! rudder.toml manifest parser.
//!
//! ```toml
//! template = "registry/app:v1"
//!
//! [replicas]
//! min = 2
//! max = 5
//!
//! [autoscale]
//! target_cpu_percent = 70.0
//! tick = "15s"
//! window = "60s"
//!
//! [rollout]
//! max_surge = 1
//! max_unavailable = 0
//! deadline = "10m"
//!
//! [probe]
//! path = "/healthz"
//! period = "5s"
//! timeout = "2s"
//! initial_delay = "3s"
//! failure_threshold = 3
//! ```
//!
//! All sections are optional; omitted fields take the documented defaults.
//! Validation happens in [`Manifest::validate`], called by every load
//! path, so an invalid manifest never produces a `DesiredState`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rudder_state::{DesiredState, ProbeSettings, RolloutSettings};

/// Errors raised while loading or admitting a manifest.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// The active instance template (workload version identifier).
    pub template: String,
    pub replicas: Option<ReplicasSection>,
    pub autoscale: Option<AutoscaleSection>,
    pub rollout: Option<RolloutSection>,
    pub probe: Option<ProbeSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicasSection {
    pub min: Option<u32>,
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscaleSection {
    pub target_cpu_percent: Option<f64>,
    /// Evaluation period (e.g. "15s").
    pub tick: Option<String>,
    /// Sliding window over which utilization is averaged (e.g. "60s").
    pub window: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutSection {
    pub max_surge: Option<u32>,
    pub max_unavailable: Option<u32>,
    /// Rollout deadline before automatic rollback (e.g. "10m").
    pub deadline: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSection {
    pub path: Option<String>,
    pub period: Option<String>,
    pub timeout: Option<String>,
    pub initial_delay: Option<String>,
    pub failure_threshold: Option<u32>,
}

impl Manifest {
    /// Load and validate a manifest from a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a manifest from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let manifest: Manifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Admission check: reject rather than clamp invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min = self.replicas_min();
        let max = self.replicas_max();
        if min < 1 {
            return Err(ConfigError::Invalid(
                "replicas.min must be at least 1".to_string(),
            ));
        }
        if min > max {
            return Err(ConfigError::Invalid(format!(
                "replicas.min ({min}) exceeds replicas.max ({max})"
            )));
        }

        let target = self.target_cpu_percent();
        if !(target > 0.0 && target <= 100.0) {
            return Err(ConfigError::Invalid(format!(
                "autoscale.target_cpu_percent ({target}) must be in (0, 100]"
            )));
        }

        if self.template.trim().is_empty() {
            return Err(ConfigError::Invalid("template must not be empty".to_string()));
        }

        if let Some(probe) = &self.probe {
            if let Some(path) = &probe.path
                && !path.starts_with('/')
            {
                return Err(ConfigError::Invalid(format!(
                    "probe.path ({path}) must start with '/'"
                )));
            }
            if probe.failure_threshold == Some(0) {
                return Err(ConfigError::Invalid(
                    "probe.failure_threshold must be at least 1".to_string(),
                ));
            }
        }

        // Duration fields must parse; zero probe period/timeout would spin.
        for (name, value) in self.duration_fields() {
            let d = parse_duration(&value)
                .ok_or_else(|| ConfigError::Invalid(format!("{name} ({value}) is not a duration")))?;
            if d.is_zero() && (name == "probe.period" || name == "probe.timeout") {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }

        Ok(())
    }

    fn duration_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        if let Some(a) = &self.autoscale {
            if let Some(v) = &a.tick {
                fields.push(("autoscale.tick", v.clone()));
            }
            if let Some(v) = &a.window {
                fields.push(("autoscale.window", v.clone()));
            }
        }
        if let Some(r) = &self.rollout
            && let Some(v) = &r.deadline
        {
            fields.push(("rollout.deadline", v.clone()));
        }
        if let Some(p) = &self.probe {
            if let Some(v) = &p.period {
                fields.push(("probe.period", v.clone()));
            }
            if let Some(v) = &p.timeout {
                fields.push(("probe.timeout", v.clone()));
            }
            if let Some(v) = &p.initial_delay {
                fields.push(("probe.initial_delay", v.clone()));
            }
        }
        fields
    }

    // ── Resolved values (defaults applied) ─────────────────────────

    pub fn replicas_min(&self) -> u32 {
        self.replicas.as_ref().and_then(|r| r.min).unwrap_or(1)
    }

    pub fn replicas_max(&self) -> u32 {
        self.replicas.as_ref().and_then(|r| r.max).unwrap_or(10)
    }

    pub fn target_cpu_percent(&self) -> f64 {
        self.autoscale
            .as_ref()
            .and_then(|a| a.target_cpu_percent)
            .unwrap_or(70.0)
    }

    /// Autoscaler evaluation period. Default 15s.
    pub fn autoscale_tick(&self) -> Duration {
        self.autoscale
            .as_ref()
            .and_then(|a| a.tick.as_deref())
            .and_then(parse_duration)
            .unwrap_or(Duration::from_secs(15))
    }

    /// Utilization averaging window. Default 60s.
    pub fn autoscale_window(&self) -> Duration {
        self.autoscale
            .as_ref()
            .and_then(|a| a.window.as_deref())
            .and_then(parse_duration)
            .unwrap_or(Duration::from_secs(60))
    }

    /// Build the admitted desired state. Initial desired count is the
    /// configured minimum; the autoscaler takes it from there.
    pub fn into_desired_state(&self, now: u64) -> DesiredState {
        let rollout = self.rollout.as_ref();
        let probe = self.probe.as_ref();
        DesiredState {
            replicas_min: self.replicas_min(),
            replicas_max: self.replicas_max(),
            target_cpu_percent: self.target_cpu_percent(),
            desired_replicas: self.replicas_min(),
            template: self.template.clone(),
            rollout: RolloutSettings {
                max_surge: rollout.and_then(|r| r.max_surge).unwrap_or(1),
                max_unavailable: rollout.and_then(|r| r.max_unavailable).unwrap_or(0),
                deadline_secs: rollout
                    .and_then(|r| r.deadline.as_deref())
                    .and_then(parse_duration)
                    .map(|d| d.as_secs())
                    .unwrap_or(600),
            },
            probe: ProbeSettings {
                path: probe
                    .and_then(|p| p.path.clone())
                    .unwrap_or_else(|| "/healthz".to_string()),
                period_secs: probe
                    .and_then(|p| p.period.as_deref())
                    .and_then(parse_duration)
                    .map(|d| d.as_secs())
                    .unwrap_or(5),
                timeout_ms: probe
                    .and_then(|p| p.timeout.as_deref())
                    .and_then(parse_duration)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(2000),
                initial_delay_secs: probe
                    .and_then(|p| p.initial_delay.as_deref())
                    .and_then(parse_duration)
                    .map(|d| d.as_secs())
                    .unwrap_or(3),
                failure_threshold: probe.and_then(|p| p.failure_threshold).unwrap_or(3),
            },
            updated_at: now,
        }
    }
}

/// Parse a duration string like "5s", "500ms", "2m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
template = "registry/app:v1"

[replicas]
min = 2
max = 5

[autoscale]
target_cpu_percent = 70.0
tick = "15s"
window = "60s"

[rollout]
max_surge = 1
max_unavailable = 0
deadline = "10m"

[probe]
path = "/healthz"
period = "5s"
timeout = "2s"
initial_delay = "3s"
failure_threshold = 3
"#;

    #[test]
    fn parses_full_manifest() {
        let manifest = Manifest::from_toml(FULL).unwrap();
        let desired = manifest.into_desired_state(1000);

        assert_eq!(desired.replicas_min, 2);
        assert_eq!(desired.replicas_max, 5);
        assert_eq!(desired.desired_replicas, 2);
        assert_eq!(desired.target_cpu_percent, 70.0);
        assert_eq!(desired.template, "registry/app:v1");
        assert_eq!(desired.rollout.max_surge, 1);
        assert_eq!(desired.rollout.max_unavailable, 0);
        assert_eq!(desired.rollout.deadline_secs, 600);
        assert_eq!(desired.probe.path, "/healthz");
        assert_eq!(desired.probe.timeout_ms, 2000);
        assert_eq!(desired.probe.failure_threshold, 3);
    }

    #[test]
    fn minimal_manifest_gets_defaults() {
        let manifest = Manifest::from_toml(r#"template = "v1""#).unwrap();
        let desired = manifest.into_desired_state(1000);

        assert_eq!(desired.replicas_min, 1);
        assert_eq!(desired.replicas_max, 10);
        assert_eq!(desired.target_cpu_percent, 70.0);
        assert_eq!(desired.rollout.deadline_secs, 600);
        assert_eq!(desired.probe.period_secs, 5);
        assert_eq!(manifest.autoscale_tick(), Duration::from_secs(15));
        assert_eq!(manifest.autoscale_window(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_min_above_max() {
        let err = Manifest::from_toml(
            r#"
template = "v1"
[replicas]
min = 6
max = 2
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn rejects_zero_min() {
        let err = Manifest::from_toml(
            r#"
template = "v1"
[replicas]
min = 0
max = 2
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_target_above_hundred() {
        let err = Manifest::from_toml(
            r#"
template = "v1"
[autoscale]
target_cpu_percent = 140.0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_relative_probe_path() {
        let err = Manifest::from_toml(
            r#"
template = "v1"
[probe]
path = "healthz"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_probe_period() {
        let err = Manifest::from_toml(
            r#"
template = "v1"
[probe]
period = "0s"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unparseable_duration() {
        let err = Manifest::from_toml(
            r#"
template = "v1"
[rollout]
deadline = "soon"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_empty_template() {
        let err = Manifest::from_toml(r#"template = """#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("soon"), None);
    }
}
