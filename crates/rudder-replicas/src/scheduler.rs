//! Scheduler seam — the external cluster scheduler's instance-lifecycle
//! interface, and the executor that applies reconciliation actions
//! through it.
//!
//! The scheduler is authoritative for actual process placement; this
//! core only hands it create/delete requests. When the scheduler is
//! unreachable the executor retries with exponential backoff and raises
//! the persisted degraded-status flag so the divergence between desired
//! and observed state is never silent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use rudder_state::{InstancePhase, InstanceRecord, StateStore, StatusFlags};

use crate::controller::ReplicaAction;

/// Errors from the external scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler could not be reached. Retried with backoff.
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    /// The scheduler refused the request. Not retried.
    #[error("scheduler rejected request: {0}")]
    Rejected(String),
}

/// A placement the scheduler has accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledInstance {
    pub id: String,
    /// Network endpoint (ip:port) for health probes.
    pub address: String,
}

/// The external cluster scheduler's instance-lifecycle interface.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Launch a new instance from the given template.
    async fn create_instance(&self, template: &str) -> Result<ScheduledInstance, SchedulerError>;

    /// Tear down an instance.
    async fn delete_instance(&self, instance_id: &str) -> Result<(), SchedulerError>;
}

/// What one `apply` pass actually did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Instances the scheduler placed; the daemon starts probe loops for
    /// these.
    pub created: Vec<ScheduledInstance>,
    /// Instance ids torn down; the daemon stops their probe loops.
    pub deleted: Vec<String>,
}

/// Applies reconciliation actions through the scheduler, serially.
///
/// Actions are applied one at a time so the rollout and replica loops,
/// which both funnel through a single executor, never race on the
/// instance set.
pub struct ActionExecutor {
    state: StateStore,
    scheduler: Arc<dyn SchedulerClient>,
    /// First retry delay after an Unavailable error.
    backoff_base: Duration,
    /// Backoff ceiling.
    backoff_max: Duration,
    /// Attempts per action before giving up until the next tick.
    max_attempts: u32,
}

impl ActionExecutor {
    pub fn new(state: StateStore, scheduler: Arc<dyn SchedulerClient>) -> Self {
        Self {
            state,
            scheduler,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
            max_attempts: 5,
        }
    }

    /// Override retry pacing (tests use near-zero delays).
    pub fn with_backoff(mut self, base: Duration, max: Duration, attempts: u32) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self.max_attempts = attempts;
        self
    }

    /// Apply a batch of actions. Stops at the first action that exhausts
    /// its retries; whatever was applied before that stands, and the
    /// degraded flag stays up for the next pass to see.
    pub async fn apply(
        &self,
        actions: Vec<ReplicaAction>,
    ) -> Result<ApplyOutcome, SchedulerError> {
        let mut outcome = ApplyOutcome::default();

        for action in actions {
            match action {
                ReplicaAction::Create { template } => {
                    let placed = self
                        .with_retries(|| self.scheduler.create_instance(&template))
                        .await?;
                    let record =
                        InstanceRecord::pending(&placed.id, &template, &placed.address, epoch_secs());
                    self.state
                        .put_instance(&record)
                        .map_err(|e| SchedulerError::Rejected(e.to_string()))?;
                    info!(id = %placed.id, %template, "instance created");
                    outcome.created.push(placed);
                }
                ReplicaAction::Delete { instance_id } => {
                    // Mark Terminating first so concurrent reconcile
                    // passes stop counting it.
                    if let Ok(Some(mut record)) = self.state.get_instance(&instance_id) {
                        record.phase = InstancePhase::Terminating;
                        record.updated_at = epoch_secs();
                        let _ = self.state.put_instance(&record);
                    }
                    self.with_retries(|| self.scheduler.delete_instance(&instance_id))
                        .await?;
                    self.state
                        .delete_instance(&instance_id)
                        .map_err(|e| SchedulerError::Rejected(e.to_string()))?;
                    info!(id = %instance_id, "instance deleted");
                    outcome.deleted.push(instance_id);
                }
            }
        }

        // Everything applied; clear the degraded flag if it was up.
        if self.state.get_status().map(|f| f.degraded).unwrap_or(false) {
            let _ = self.state.put_status(&StatusFlags::healthy(epoch_secs()));
            info!("scheduler recovered, degraded flag cleared");
        }

        Ok(outcome)
    }

    /// Run one scheduler call with exponential backoff on Unavailable.
    async fn with_retries<T, F, Fut>(&self, mut call: F) -> Result<T, SchedulerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SchedulerError>>,
    {
        let mut delay = self.backoff_base;
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(SchedulerError::Unavailable(reason)) => {
                    let _ = self
                        .state
                        .put_status(&StatusFlags::degraded(&reason, epoch_secs()));
                    if attempt >= self.max_attempts {
                        warn!(%reason, attempt, "scheduler still unavailable, pausing until next tick");
                        return Err(SchedulerError::Unavailable(reason));
                    }
                    debug!(%reason, attempt, delay_ms = delay.as_millis() as u64, "scheduler unavailable, backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.backoff_max);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Fake scheduler (tests and standalone demos) ────────────────────

/// In-memory scheduler double. Placement is immediate; the address is a
/// loopback port derived from a counter.
pub struct FakeScheduler {
    inner: std::sync::Mutex<FakeInner>,
}

struct FakeInner {
    next_id: u64,
    placed: std::collections::HashMap<String, String>,
    unavailable: bool,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(FakeInner {
                next_id: 0,
                placed: std::collections::HashMap::new(),
                unavailable: false,
            }),
        }
    }

    /// Simulate the scheduler going away (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    pub fn placed_count(&self) -> usize {
        self.inner.lock().unwrap().placed.len()
    }

    pub fn is_placed(&self, instance_id: &str) -> bool {
        self.inner.lock().unwrap().placed.contains_key(instance_id)
    }
}

impl Default for FakeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulerClient for FakeScheduler {
    async fn create_instance(&self, template: &str) -> Result<ScheduledInstance, SchedulerError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(SchedulerError::Unavailable("fake scheduler down".to_string()));
        }
        inner.next_id += 1;
        let id = format!("inst-{}", inner.next_id);
        let address = format!("127.0.0.1:{}", 20000 + inner.next_id);
        inner.placed.insert(id.clone(), template.to_string());
        Ok(ScheduledInstance { id, address })
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(SchedulerError::Unavailable("fake scheduler down".to_string()));
        }
        inner.placed.remove(instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(state: StateStore, scheduler: Arc<FakeScheduler>) -> ActionExecutor {
        ActionExecutor::new(state, scheduler).with_backoff(
            Duration::from_millis(1),
            Duration::from_millis(2),
            3,
        )
    }

    #[tokio::test]
    async fn create_places_instance_and_stores_record() {
        let state = StateStore::open_in_memory().unwrap();
        let scheduler = Arc::new(FakeScheduler::new());
        let exec = executor(state.clone(), scheduler.clone());

        let outcome = exec
            .apply(vec![ReplicaAction::Create { template: "v1".to_string() }])
            .await
            .unwrap();

        assert_eq!(outcome.created.len(), 1);
        assert_eq!(scheduler.placed_count(), 1);

        let record = state.get_instance(&outcome.created[0].id).unwrap().unwrap();
        assert_eq!(record.phase, InstancePhase::Pending);
        assert_eq!(record.template, "v1");
    }

    #[tokio::test]
    async fn delete_removes_placement_and_record() {
        let state = StateStore::open_in_memory().unwrap();
        let scheduler = Arc::new(FakeScheduler::new());
        let exec = executor(state.clone(), scheduler.clone());

        let outcome = exec
            .apply(vec![ReplicaAction::Create { template: "v1".to_string() }])
            .await
            .unwrap();
        let id = outcome.created[0].id.clone();

        let outcome = exec
            .apply(vec![ReplicaAction::Delete { instance_id: id.clone() }])
            .await
            .unwrap();

        assert_eq!(outcome.deleted, vec![id.clone()]);
        assert!(!scheduler.is_placed(&id));
        assert!(state.get_instance(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_scheduler_raises_degraded_flag() {
        let state = StateStore::open_in_memory().unwrap();
        let scheduler = Arc::new(FakeScheduler::new());
        scheduler.set_unavailable(true);
        let exec = executor(state.clone(), scheduler.clone());

        let result = exec
            .apply(vec![ReplicaAction::Create { template: "v1".to_string() }])
            .await;

        assert!(matches!(result, Err(SchedulerError::Unavailable(_))));
        let flags = state.get_status().unwrap();
        assert!(flags.degraded);
        assert!(flags.reason.is_some());
        // Nothing was placed and no record was written.
        assert_eq!(scheduler.placed_count(), 0);
        assert!(state.list_instances().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_clears_degraded_flag() {
        let state = StateStore::open_in_memory().unwrap();
        let scheduler = Arc::new(FakeScheduler::new());
        let exec = executor(state.clone(), scheduler.clone());

        scheduler.set_unavailable(true);
        let _ = exec
            .apply(vec![ReplicaAction::Create { template: "v1".to_string() }])
            .await;
        assert!(state.get_status().unwrap().degraded);

        scheduler.set_unavailable(false);
        exec.apply(vec![ReplicaAction::Create { template: "v1".to_string() }])
            .await
            .unwrap();
        assert!(!state.get_status().unwrap().degraded);
    }

    #[tokio::test]
    async fn batch_applies_in_order() {
        let state = StateStore::open_in_memory().unwrap();
        let scheduler = Arc::new(FakeScheduler::new());
        let exec = executor(state.clone(), scheduler.clone());

        let outcome = exec
            .apply(vec![
                ReplicaAction::Create { template: "v1".to_string() },
                ReplicaAction::Create { template: "v1".to_string() },
                ReplicaAction::Create { template: "v1".to_string() },
            ])
            .await
            .unwrap();

        assert_eq!(outcome.created.len(), 3);
        assert_eq!(state.list_instances().unwrap().len(), 3);
    }
}
