use async_trait::async_trait;
use thiserror::Error;

use crate::model::{RawLedgerEvent, SubscriptionOptions, WatchTarget};

/// Common result alias for ledger client calls.
pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown watch target `{0}`")]
    UnknownTarget(String),
    #[error("ledger rpc error: {0}")]
    Rpc(String),
    #[error("malformed ledger response: {0}")]
    Malformed(String),
    #[error("ledger connection closed")]
    Closed,
}

impl LedgerError {
    pub fn from_source(err: impl std::fmt::Display) -> Self {
        Self::Rpc(err.to_string())
    }

    pub fn unknown_target(target: &WatchTarget) -> Self {
        Self::UnknownTarget(target.to_string())
    }
}

/// A live native subscription. Items are pulled in arrival order.
#[async_trait]
pub trait PushSubscription: Send {
    /// Next upstream item. `None` means the upstream finished cleanly; an
    /// `Err` means the subscription itself failed.
    async fn next_event(&mut self) -> Option<LedgerResult<RawLedgerEvent>>;

    async fn unsubscribe(&mut self) -> LedgerResult<()>;
}

/// Ledger client exposing a native push subscription.
#[async_trait]
pub trait PushLedgerClient: Send + Sync {
    /// Registers a native subscription. Fails with `UnknownTarget` when the
    /// target does not exist upstream.
    async fn subscribe_native(
        &self,
        options: &SubscriptionOptions,
    ) -> LedgerResult<Box<dyn PushSubscription>>;
}

/// Ledger client exposing a "list new items since cursor" operation.
///
/// Must tolerate concurrent independent calls from several adapters; cursor
/// state lives in the adapters.
#[async_trait]
pub trait PollLedgerClient: Send + Sync {
    /// Verifies the target and prepares any server-side bookkeeping.
    async fn start_monitor(&self, target: &WatchTarget) -> LedgerResult<()>;

    /// Items newer than `cursor` (all retained items when `None`).
    async fn list_since(
        &self,
        options: &SubscriptionOptions,
        cursor: Option<u64>,
    ) -> LedgerResult<Vec<RawLedgerEvent>>;

    /// Tells the ledger the client is done with items up to `cursor`.
    async fn advance_cursor(&self, target: &WatchTarget, cursor: u64) -> LedgerResult<()>;

    async fn stop_monitor(&self, _target: &WatchTarget) -> LedgerResult<()> {
        Ok(())
    }
}
