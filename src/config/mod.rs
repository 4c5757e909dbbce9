//! Persisted configuration
//!
//! `AppConfig` is stored as JSON in the data directory and cached behind an
//! `ArcSwap` so that hot paths (the orchestrator thread) read it lock-free.

mod schema;
mod store;

pub use schema::*;
pub use store::{apply_env_overrides, ConfigChange, ConfigStore};
