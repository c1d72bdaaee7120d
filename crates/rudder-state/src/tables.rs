//! redb table definitions for the rudder state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Singleton rows (desired state, rollout plan, status flags) live
//! under fixed keys.

use redb::TableDefinition;

/// Desired state singleton, keyed by [`DESIRED_KEY`].
pub const DESIRED: TableDefinition<&str, &[u8]> = TableDefinition::new("desired");

/// Instance records keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Utilization samples keyed by zero-padded `{epoch_secs}-{seq}`
/// (time-ordered, collision-free within a second).
pub const SAMPLES: TableDefinition<&str, &[u8]> = TableDefinition::new("samples");

/// Active rollout plan singleton, keyed by [`ROLLOUT_KEY`].
pub const ROLLOUT: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout");

/// Degraded-status flags singleton, keyed by [`STATUS_KEY`].
pub const STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("status");

pub const DESIRED_KEY: &str = "desired";
pub const ROLLOUT_KEY: &str = "active";
pub const STATUS_KEY: &str = "flags";
