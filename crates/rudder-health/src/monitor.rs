//! Probe monitor — one background probe loop per instance.
//!
//! Each loop waits out the configured initial delay, then probes the
//! instance endpoint every period. Every readiness transition is written
//! through the state store before the optional callback fires, so the
//! replica controller never reads a result that is newer than what the
//! store holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use rudder_state::{InstancePhase, ProbeOutcome, ProbeSettings, Readiness, StateStore};

use crate::prober::{ProbeTracker, http_probe};

/// Callback invoked when an instance's readiness changes.
///
/// The replica loop uses this to react to failures without waiting for
/// its next tick.
pub type ReadinessCallback = Arc<dyn Fn(String, Readiness) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Per-instance monitor state.
struct ProbeSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages probe loops for all live instances.
pub struct ProbeMonitor {
    state: StateStore,
    /// Active probe loops: instance_id → slot.
    slots: Arc<RwLock<HashMap<String, ProbeSlot>>>,
    /// Optional callback when readiness changes.
    on_change: Option<ReadinessCallback>,
}

impl ProbeMonitor {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            slots: Arc::new(RwLock::new(HashMap::new())),
            on_change: None,
        }
    }

    /// Set a callback for readiness transitions.
    pub fn with_callback(mut self, callback: ReadinessCallback) -> Self {
        self.on_change = Some(callback);
        self
    }

    /// Start probing an instance at the given address (ip:port).
    pub async fn start_probe(&self, instance_id: &str, address: &str, settings: &ProbeSettings) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let id = instance_id.to_string();
        let target = address.to_string();
        let settings = settings.clone();
        let state = self.state.clone();
        let callback = self.on_change.clone();

        let handle = tokio::spawn(async move {
            run_probe_loop(&id, &target, &settings, state, callback, shutdown_rx).await;
        });

        let mut slots = self.slots.write().await;
        if let Some(old) = slots.insert(
            instance_id.to_string(),
            ProbeSlot {
                handle,
                shutdown_tx,
            },
        ) {
            // Stop the old loop if one was running for this id.
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(%instance_id, %address, "probe loop started");
    }

    /// Stop probing an instance.
    pub async fn stop_probe(&self, instance_id: &str) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.remove(instance_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%instance_id, "probe loop stopped");
        }
    }

    /// Stop all probe loops (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut slots = self.slots.write().await;
        for (id, slot) in slots.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(instance_id = %id, "probe loop stopped");
        }
        info!("all probe loops stopped");
    }

    /// Instance ids with active probe loops.
    pub async fn active_probes(&self) -> Vec<String> {
        let slots = self.slots.read().await;
        slots.keys().cloned().collect()
    }

    /// Whether an instance is being probed.
    pub async fn is_probing(&self, instance_id: &str) -> bool {
        let slots = self.slots.read().await;
        slots.contains_key(instance_id)
    }
}

/// The probe loop for a single instance.
async fn run_probe_loop(
    instance_id: &str,
    address: &str,
    settings: &ProbeSettings,
    state: StateStore,
    callback: Option<ReadinessCallback>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_secs(settings.period_secs);
    let timeout = Duration::from_millis(settings.timeout_ms);
    let mut tracker = ProbeTracker::new(settings);

    debug!(%instance_id, delay = settings.initial_delay_secs, "probe loop starting");

    // Initial delay before the first probe.
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(settings.initial_delay_secs)) => {}
        _ = shutdown.changed() => return,
    }

    loop {
        let outcome = http_probe(address, &settings.path, timeout).await;
        let prev = tracker.readiness();
        let readiness = tracker.record(outcome);

        if let Err(e) =
            record_probe_result(&state, instance_id, outcome, readiness, tracker.is_failed())
        {
            error!(%instance_id, error = %e, "failed to record probe result");
        }

        if readiness != prev
            && let Some(ref cb) = callback
        {
            cb(instance_id.to_string(), readiness).await;
        }

        if tracker.is_failed() {
            // Replacement is the replica controller's job; nothing more
            // for this loop to learn.
            debug!(%instance_id, "probe loop ending, instance failed");
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => {
                debug!(%instance_id, "probe loop shutting down");
                return;
            }
        }
    }
}

/// Write a probe result through the store: readiness, last probe outcome,
/// and the phase transitions it implies (Running → Ready on success,
/// anything → Failed once the threshold is crossed).
pub fn record_probe_result(
    state: &StateStore,
    instance_id: &str,
    outcome: ProbeOutcome,
    readiness: Readiness,
    failed: bool,
) -> Result<(), rudder_state::StateError> {
    let Some(mut record) = state.get_instance(instance_id)? else {
        // Instance already deleted; nothing to record.
        return Ok(());
    };

    record.last_probe = Some(outcome);
    record.readiness = readiness;
    record.updated_at = epoch_secs();

    if failed {
        record.phase = InstancePhase::Failed;
    } else if readiness == Readiness::Ready
        && matches!(record.phase, InstancePhase::Pending | InstancePhase::Running)
    {
        record.phase = InstancePhase::Ready;
    } else if readiness == Readiness::NotReady && record.phase == InstancePhase::Ready {
        record.phase = InstancePhase::Running;
    }

    state.put_instance(&record)?;
    Ok(())
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_state::InstanceRecord;

    fn test_settings() -> ProbeSettings {
        ProbeSettings {
            path: "/healthz".to_string(),
            period_secs: 1,
            timeout_ms: 100,
            initial_delay_secs: 0,
            failure_threshold: 3,
        }
    }

    fn seed_instance(state: &StateStore, id: &str) -> InstanceRecord {
        let record = InstanceRecord::pending(id, "v1", "127.0.0.1:20001", 1000);
        state.put_instance(&record).unwrap();
        record
    }

    #[tokio::test]
    async fn monitor_starts_and_stops() {
        let state = StateStore::open_in_memory().unwrap();
        let monitor = ProbeMonitor::new(state);

        assert!(monitor.active_probes().await.is_empty());

        // Nothing listens at the address; lifecycle is what's under test.
        monitor.start_probe("i-0", "127.0.0.1:1", &test_settings()).await;
        assert!(monitor.is_probing("i-0").await);

        monitor.stop_probe("i-0").await;
        assert!(!monitor.is_probing("i-0").await);
    }

    #[tokio::test]
    async fn monitor_stop_all() {
        let state = StateStore::open_in_memory().unwrap();
        let monitor = ProbeMonitor::new(state);

        monitor.start_probe("i-0", "127.0.0.1:1", &test_settings()).await;
        monitor.start_probe("i-1", "127.0.0.1:1", &test_settings()).await;
        assert_eq!(monitor.active_probes().await.len(), 2);

        monitor.stop_all().await;
        assert!(monitor.active_probes().await.is_empty());
    }

    #[tokio::test]
    async fn restart_replaces_existing_loop() {
        let state = StateStore::open_in_memory().unwrap();
        let monitor = ProbeMonitor::new(state);

        monitor.start_probe("i-0", "127.0.0.1:1", &test_settings()).await;
        monitor.start_probe("i-0", "127.0.0.1:2", &test_settings()).await;

        assert_eq!(monitor.active_probes().await.len(), 1);
        monitor.stop_all().await;
    }

    #[test]
    fn success_promotes_pending_to_ready() {
        let state = StateStore::open_in_memory().unwrap();
        seed_instance(&state, "i-0");

        record_probe_result(&state, "i-0", ProbeOutcome::Success, Readiness::Ready, false)
            .unwrap();

        let record = state.get_instance("i-0").unwrap().unwrap();
        assert_eq!(record.phase, InstancePhase::Ready);
        assert_eq!(record.readiness, Readiness::Ready);
        assert_eq!(record.last_probe, Some(ProbeOutcome::Success));
    }

    #[test]
    fn failure_demotes_ready_to_running() {
        let state = StateStore::open_in_memory().unwrap();
        let mut record = seed_instance(&state, "i-0");
        record.phase = InstancePhase::Ready;
        record.readiness = Readiness::Ready;
        state.put_instance(&record).unwrap();

        record_probe_result(&state, "i-0", ProbeOutcome::Failure, Readiness::NotReady, false)
            .unwrap();

        let record = state.get_instance("i-0").unwrap().unwrap();
        assert_eq!(record.phase, InstancePhase::Running);
        assert_eq!(record.readiness, Readiness::NotReady);
    }

    #[test]
    fn threshold_crossing_marks_phase_failed() {
        let state = StateStore::open_in_memory().unwrap();
        seed_instance(&state, "i-0");

        record_probe_result(&state, "i-0", ProbeOutcome::Failure, Readiness::NotReady, true)
            .unwrap();

        let record = state.get_instance("i-0").unwrap().unwrap();
        assert_eq!(record.phase, InstancePhase::Failed);
    }

    #[test]
    fn result_for_deleted_instance_is_ignored() {
        let state = StateStore::open_in_memory().unwrap();
        // No record seeded; a probe completing after deletion is a no-op.
        record_probe_result(&state, "gone", ProbeOutcome::Success, Readiness::Ready, false)
            .unwrap();
        assert!(state.get_instance("gone").unwrap().is_none());
    }
}
