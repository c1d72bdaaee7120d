//! rudder-state — embedded state store for the rudder control loops.
//!
//! Backed by [redb](https://docs.rs/redb), persists the desired state,
//! the observed instance set, the utilization sample window, the active
//! rollout plan, and the degraded-status flags.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! The instance set is keyed by instance id; utilization samples use
//! zero-padded epoch keys with a sequence suffix so an iteration walks
//! them in time order and same-second samples never collide.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is the single synchronization point between the probe loops and the
//! reconciliation loops: every readiness transition is written here before
//! any controller reads it.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
