//! Error taxonomy surfaced at the session boundary.

use thiserror::Error;

use crate::{ledger::LedgerError, model::OptionsError};

/// How a watch failed, and therefore who gets to see it.
///
/// `Configuration` and `StreamFatal` always reach the caller. `TransientEvent`
/// is recovered inside the session. `Transport` closes the session without
/// retrying.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("invalid subscription: {0}")]
    Configuration(String),
    #[error("event dropped: {0}")]
    TransientEvent(String),
    #[error("event stream failed: {0}")]
    StreamFatal(String),
    #[error("outbound delivery failed: {0}")]
    Transport(String),
}

impl WatchError {
    /// Maps a failure of `start` onto the taxonomy. Unknown targets are the
    /// caller's problem; anything else means the source is unusable.
    pub fn from_start_failure(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownTarget(_) => Self::Configuration(err.to_string()),
            other => Self::StreamFatal(other.to_string()),
        }
    }

    pub fn is_caller_visible(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::StreamFatal(_))
    }
}

impl From<OptionsError> for WatchError {
    fn from(value: OptionsError) -> Self {
        Self::Configuration(value.to_string())
    }
}
