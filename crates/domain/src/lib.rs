//! Domain-level building blocks shared across the monitor and API crates:
//! the event and session model, the error taxonomy, ledger client contracts,
//! environment configuration, and telemetry wiring.

pub mod config;
pub mod error;
pub mod ledger;
pub mod model;
pub mod services;

pub use config::{ConfigError, SessionSettings, SourceMode, WatchConfig};
pub use error::WatchError;
pub use ledger::*;
pub use model::*;
