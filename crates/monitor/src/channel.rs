//! Outbound channel: transport-agnostic delivery to the remote caller plus
//! the control plane carrying caller-initiated signals back to the session.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::mpsc;

use ledger_watch_domain::{CloseReason, NormalizedEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ControlSignal {
    Unsubscribe,
    Disconnect,
}

impl From<ControlSignal> for CloseReason {
    fn from(value: ControlSignal) -> Self {
        match value {
            ControlSignal::Unsubscribe => CloseReason::Unsubscribe,
            ControlSignal::Disconnect => CloseReason::Disconnect,
        }
    }
}

pub type ControlCallback = Box<dyn Fn(ControlSignal) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("a control callback is already registered")]
    AlreadyRegistered,
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Delivery side of a caller connection.
///
/// `send` is ordered and at-most-once per call; implementations may delay it
/// to apply backpressure but never retry internally.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn send(&self, event: NormalizedEvent) -> Result<(), ChannelError>;

    /// Registers the single control callback for this connection.
    fn on_control_signal(&self, callback: ControlCallback) -> Result<(), ChannelError>;

    /// Idempotently terminates the transport side.
    async fn close(&self);
}

/// Control-plane bookkeeping for channel implementations: one callback, each
/// signal type fired at most once, and signals raised before registration
/// held until a callback arrives.
#[derive(Default)]
pub struct ControlSignals {
    inner: Mutex<ControlState>,
}

#[derive(Default)]
struct ControlState {
    callback: Option<Arc<dyn Fn(ControlSignal) + Send + Sync>>,
    fired: HashSet<ControlSignal>,
    pending: Vec<ControlSignal>,
}

impl ControlSignals {
    pub fn register(&self, callback: ControlCallback) -> Result<(), ChannelError> {
        let callback: Arc<dyn Fn(ControlSignal) + Send + Sync> = Arc::from(callback);
        let pending = {
            let mut state = self.lock();
            if state.callback.is_some() {
                return Err(ChannelError::AlreadyRegistered);
            }
            state.callback = Some(callback.clone());
            std::mem::take(&mut state.pending)
        };
        for signal in pending {
            callback(signal);
        }
        Ok(())
    }

    /// Returns `false` when this signal type already fired on the connection.
    pub fn raise(&self, signal: ControlSignal) -> bool {
        let callback = {
            let mut state = self.lock();
            if !state.fired.insert(signal) {
                return false;
            }
            match state.callback.clone() {
                Some(callback) => callback,
                None => {
                    state.pending.push(signal);
                    return true;
                }
            }
        };
        callback(signal);
        true
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process channel over a bounded queue. The [`RemoteEnd`] plays the
/// caller: it reads events and raises control signals.
pub struct MemoryChannel {
    tx: Mutex<Option<mpsc::Sender<NormalizedEvent>>>,
    signals: Arc<ControlSignals>,
    close_calls: AtomicUsize,
}

impl MemoryChannel {
    pub fn new(capacity: usize) -> (Arc<Self>, RemoteEnd) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let signals = Arc::new(ControlSignals::default());
        let channel = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            signals: signals.clone(),
            close_calls: AtomicUsize::new(0),
        });
        (channel, RemoteEnd { rx, signals })
    }

    /// How many times `close` was invoked, including no-op repeats.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[async_trait]
impl OutboundChannel for MemoryChannel {
    async fn send(&self, event: NormalizedEvent) -> Result<(), ChannelError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ChannelError::Closed)?;
        tx.send(event).await.map_err(|_| ChannelError::Closed)
    }

    fn on_control_signal(&self, callback: ControlCallback) -> Result<(), ChannelError> {
        self.signals.register(callback)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Caller side of a [`MemoryChannel`].
pub struct RemoteEnd {
    rx: mpsc::Receiver<NormalizedEvent>,
    signals: Arc<ControlSignals>,
}

impl RemoteEnd {
    pub async fn recv(&mut self) -> Option<NormalizedEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<NormalizedEvent> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(&self) -> bool {
        self.signals.raise(ControlSignal::Unsubscribe)
    }

    /// Drops the connection: further sends fail and the session is told.
    pub fn disconnect(&mut self) -> bool {
        self.rx.close();
        self.signals.raise(ControlSignal::Disconnect)
    }
}
