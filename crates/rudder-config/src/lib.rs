//! rudder-config — `rudder.toml` manifest parsing.
//!
//! The manifest is the declarative input for the desired state. It is
//! validated as a whole at load time: an invalid manifest (e.g.
//! `replicas.min > replicas.max`) is rejected outright and no partial
//! state is applied.

pub mod manifest;

pub use manifest::{ConfigError, Manifest, parse_duration};
