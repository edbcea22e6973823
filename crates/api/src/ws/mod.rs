//! WatchBlocksV1 over WebSocket: one subscription per connection.

mod channel;
mod protocol;

use std::{net::SocketAddr, sync::Arc};

use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use metrics::counter;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{accept_async, tungstenite, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};

use ledger_watch_monitor::{ControlSignal, OutboundChannel, SessionHandle, WatchHub};

pub use channel::WsOutboundChannel;
pub use protocol::{ClientMessage, ServerMessage};

const FRAME_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
}

/// Accepts connections until the listener fails for good.
pub async fn serve(listener: TcpListener, hub: WatchHub) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(reason = %err, "failed to accept watch connection");
                continue;
            }
        };
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, hub).await {
                debug!(%peer, reason = %err, "watch connection dropped");
            }
        });
    }
}

pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: WatchHub,
) -> Result<(), WsError> {
    let socket = accept_async(stream).await?;
    counter!("watch_connections_total").increment(1);
    debug!(%peer, "watch connection opened");

    let (sink, mut reader) = socket.split();
    let (channel, frames) = WsOutboundChannel::new(FRAME_QUEUE);
    let mut writer = tokio::spawn(write_frames(sink, frames, channel.clone()));
    let mut writer_done = false;
    let mut session: Option<SessionHandle> = None;

    loop {
        let frame = tokio::select! {
            frame = reader.next() => frame,
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!(%peer, reason = %err, "watch connection read failed");
                break;
            }
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Subscribe { options }) => {
                if session.is_some() {
                    let _ = channel
                        .reply(&ServerMessage::rejected("connection already has a subscription"))
                        .await;
                    continue;
                }
                match hub.subscribe(options, channel.clone()).await {
                    Ok(handle) => {
                        let reply = ServerMessage::Subscribed {
                            session_id: handle.id().clone(),
                        };
                        let _ = channel.reply(&reply).await;
                        channel.open_gate();
                        info!(%peer, session_id = %handle.id(), "watch subscribed");
                        session = Some(handle);
                    }
                    Err(err) => {
                        let _ = channel.reply(&ServerMessage::rejected(&err)).await;
                    }
                }
            }
            Ok(ClientMessage::Unsubscribe) => match &session {
                Some(handle) => {
                    hub.unsubscribe(handle).await;
                }
                None => {
                    let _ = channel
                        .reply(&ServerMessage::rejected("no active subscription"))
                        .await;
                }
            },
            Err(err) => {
                let _ = channel
                    .reply(&ServerMessage::rejected(format!("invalid message: {err}")))
                    .await;
            }
        }
    }

    // Still live here means the caller went away first.
    if let (Some(handle), false) = (&session, channel.is_closed()) {
        hub.on_disconnect(handle).await;
    }
    channel.close().await;
    if !writer_done {
        let _ = writer.await;
    }
    debug!(%peer, "watch connection closed");
    Ok(())
}

async fn write_frames(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut frames: mpsc::Receiver<Message>,
    channel: Arc<WsOutboundChannel>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(err) = sink.send(frame).await {
            debug!(reason = %err, "watch connection write failed");
            channel.raise(ControlSignal::Disconnect);
            return;
        }
    }
    let _ = sink.close().await;
}
