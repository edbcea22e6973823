use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a subscriber wants to watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WatchTarget {
    AllBlocks,
    StateClass { name: String },
    Contract { address: String },
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTarget::AllBlocks => f.write_str("all-blocks"),
            WatchTarget::StateClass { name } => write!(f, "state:{name}"),
            WatchTarget::Contract { address } => write!(f, "contract:{address}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadShape {
    #[default]
    HeadersOnly,
    FullBlock,
}

/// Caller-supplied watch configuration. Immutable once a session owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionOptions {
    target: WatchTarget,
    #[serde(default)]
    start_cursor: Option<u64>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    shape: PayloadShape,
    #[serde(default)]
    stringify_fields: bool,
}

impl SubscriptionOptions {
    pub fn new(target: WatchTarget) -> Self {
        Self {
            target,
            start_cursor: None,
            poll_interval_ms: None,
            shape: PayloadShape::default(),
            stringify_fields: false,
        }
    }

    pub fn with_start_cursor(mut self, cursor: u64) -> Self {
        self.start_cursor = Some(cursor);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_shape(mut self, shape: PayloadShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_stringified_fields(mut self, enabled: bool) -> Self {
        self.stringify_fields = enabled;
        self
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn start_cursor(&self) -> Option<u64> {
        self.start_cursor
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }

    pub fn shape(&self) -> PayloadShape {
        self.shape
    }

    pub fn stringify_fields(&self) -> bool {
        self.stringify_fields
    }

    /// Rejects options that can never describe a valid watch.
    pub fn validate(&self) -> Result<(), OptionsError> {
        match &self.target {
            WatchTarget::StateClass { name } if name.trim().is_empty() => {
                return Err(OptionsError::BlankStateClass)
            }
            WatchTarget::Contract { address } if address.trim().is_empty() => {
                return Err(OptionsError::BlankContract)
            }
            _ => {}
        }
        if self.poll_interval_ms == Some(0) {
            return Err(OptionsError::ZeroPollInterval);
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OptionsError {
    #[error("state class name must not be blank")]
    BlankStateClass,
    #[error("contract address must not be blank")]
    BlankContract,
    #[error("poll interval must be at least 1ms")]
    ZeroPollInterval,
}
