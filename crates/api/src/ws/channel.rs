use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use ledger_watch_domain::NormalizedEvent;
use ledger_watch_monitor::{
    ChannelError, ControlCallback, ControlSignal, ControlSignals, OutboundChannel,
};

use super::protocol::ServerMessage;

/// Outbound side of one WebSocket connection.
///
/// Frames go through a bounded queue drained by the connection's writer
/// task. Session events are held back until the connection opens the gate,
/// so the `Subscribed` reply always precedes the first event.
pub struct WsOutboundChannel {
    frames: Mutex<Option<mpsc::Sender<Message>>>,
    gate: watch::Sender<bool>,
    signals: ControlSignals,
}

impl WsOutboundChannel {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (gate, _) = watch::channel(false);
        let channel = Arc::new(Self {
            frames: Mutex::new(Some(tx)),
            gate,
            signals: ControlSignals::default(),
        });
        (channel, rx)
    }

    /// Queues a control reply, bypassing the gate.
    pub async fn reply(&self, message: &ServerMessage) -> Result<(), ChannelError> {
        let text =
            serde_json::to_string(message).map_err(|err| ChannelError::Transport(err.to_string()))?;
        self.push(Message::Text(text)).await
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn raise(&self, signal: ControlSignal) -> bool {
        self.signals.raise(signal)
    }

    pub fn is_closed(&self) -> bool {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    async fn push(&self, frame: Message) -> Result<(), ChannelError> {
        let tx = self
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ChannelError::Closed)?;
        tx.send(frame).await.map_err(|_| ChannelError::Closed)
    }
}

#[async_trait]
impl OutboundChannel for WsOutboundChannel {
    async fn send(&self, event: NormalizedEvent) -> Result<(), ChannelError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let text =
            serde_json::to_string(&event).map_err(|err| ChannelError::Transport(err.to_string()))?;
        self.push(Message::Text(text)).await
    }

    fn on_control_signal(&self, callback: ControlCallback) -> Result<(), ChannelError> {
        self.signals.register(callback)
    }

    async fn close(&self) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Wakes any send parked on the gate so it fails fast.
        self.gate.send_replace(true);
    }
}
