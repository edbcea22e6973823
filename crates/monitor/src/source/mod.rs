//! Event source adapters: uniform producers of [`RawLedgerEvent`]s over push
//! subscriptions and poll loops.
//!
//! `start` spawns one producer task per handle and returns the receiving end
//! of a bounded queue plus a [`SourceControl`]. A full queue back-pressures the
//! producer; nothing is dropped to make room.

mod cursor;
mod poll;
mod push;

use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use ledger_watch_domain::{error::WatchError, RawLedgerEvent, SubscriptionOptions};

pub use cursor::SequenceGate;
pub use poll::PollEventSource;
pub use push::PushEventSource;

/// Item handed from a producer task to its session.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Raw(RawLedgerEvent),
    /// The upstream subscription or poll source died. Always the last item.
    Failed(String),
    /// The upstream finished cleanly. Always the last item.
    Completed,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    fn mode(&self) -> &'static str;

    /// Starts producing for `options`. Fails fast, without a handle, when the
    /// target is unknown upstream.
    async fn start(&self, options: &SubscriptionOptions) -> Result<SourceHandle, WatchError>;
}

/// A started source: its event queue and the means to stop it.
#[derive(Debug)]
pub struct SourceHandle {
    events: mpsc::Receiver<SourceEvent>,
    control: SourceControl,
}

impl SourceHandle {
    pub fn new(events: mpsc::Receiver<SourceEvent>, control: SourceControl) -> Self {
        Self { events, control }
    }

    pub async fn recv(&mut self) -> Option<SourceEvent> {
        self.events.recv().await
    }

    pub async fn stop(&mut self) -> StopOutcome {
        self.control.stop().await
    }

    pub fn into_parts(self) -> (mpsc::Receiver<SourceEvent>, SourceControl) {
        (self.events, self.control)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
    /// The producer did not finish within the teardown timeout and was
    /// aborted.
    TimedOut,
}

/// Stop side of a producer task. `stop` is idempotent.
#[derive(Debug)]
pub struct SourceControl {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    teardown_timeout: Duration,
}

impl SourceControl {
    pub fn new(stop_tx: watch::Sender<bool>, task: JoinHandle<()>, teardown_timeout: Duration) -> Self {
        Self {
            stop_tx,
            task: Some(task),
            teardown_timeout,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_none()
    }

    /// Signals the producer and waits for it to release upstream resources.
    /// Past the teardown timeout the task is aborted so local resources are
    /// freed even when the upstream call hangs.
    pub async fn stop(&mut self) -> StopOutcome {
        let Some(mut task) = self.task.take() else {
            return StopOutcome::AlreadyStopped;
        };
        self.stop_tx.send_replace(true);

        match timeout(self.teardown_timeout, &mut task).await {
            Ok(Ok(())) => {
                counter!("watch_teardown_total", "result" => "stopped").increment(1);
                debug!("event source stopped");
                StopOutcome::Stopped
            }
            Ok(Err(err)) => {
                counter!("watch_teardown_total", "result" => "panicked").increment(1);
                warn!(reason = %err, "event source task ended abnormally");
                StopOutcome::Stopped
            }
            Err(_) => {
                task.abort();
                counter!("watch_teardown_total", "result" => "timed_out").increment(1);
                warn!(
                    timeout_ms = self.teardown_timeout.as_millis() as u64,
                    "event source did not stop in time; aborted"
                );
                StopOutcome::TimedOut
            }
        }
    }
}

impl Drop for SourceControl {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.stop_tx.send_replace(true);
        }
    }
}

/// Resolves once a stop has been requested (or the control is gone).
pub(crate) async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmitError {
    Stopped,
    ReceiverGone,
}

/// Pushes one item to the session, waiting for queue space unless a stop
/// arrives first.
pub(crate) async fn emit(
    tx: &mpsc::Sender<SourceEvent>,
    stop_rx: &mut watch::Receiver<bool>,
    event: SourceEvent,
) -> Result<(), EmitError> {
    tokio::select! {
        biased;
        _ = stop_requested(stop_rx) => Err(EmitError::Stopped),
        sent = tx.send(event) => sent.map_err(|_| EmitError::ReceiverGone),
    }
}

pub(crate) fn spawn_producer<F>(
    capacity: usize,
    teardown_timeout: Duration,
    producer: impl FnOnce(mpsc::Sender<SourceEvent>, watch::Receiver<bool>) -> F,
) -> SourceHandle
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(producer(tx, stop_rx));
    SourceHandle::new(rx, SourceControl::new(stop_tx, task, teardown_timeout))
}
