//! Ethereum-style JSON-RPC ledger client (Besu, Quorum, geth and friends).
//!
//! Polling walks `eth_getBlockByNumber` forward from the caller's cursor;
//! pushing rides an `eth_subscribe("newHeads")` WebSocket subscription.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde_json::{json, Value};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use ledger_watch_domain::{
    LedgerError, LedgerResult, PayloadShape, PollLedgerClient, PushLedgerClient, PushSubscription,
    RawLedgerEvent, SubscriptionOptions, WatchConfig, WatchTarget,
};

mod types;

pub use types::{
    block_number, format_quantity, parse_quantity, JsonRpcErrorObject, JsonRpcRequest,
    JsonRpcResponse, NotificationParams, SubscriptionNotification,
};

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Plain HTTP JSON-RPC transport. Cheap to clone; clones share the request
/// id counter.
#[derive(Debug, Clone)]
pub struct JsonRpcHttp {
    client: reqwest::Client,
    url: String,
    next_id: Arc<AtomicU64>,
}

impl JsonRpcHttp {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn call(&self, method: &'static str, params: Value) -> LedgerResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response: JsonRpcResponse = self
            .client
            .post(&self.url)
            .json(&JsonRpcRequest::new(id, method, params))
            .send()
            .await
            .map_err(LedgerError::from_source)?
            .error_for_status()
            .map_err(LedgerError::from_source)?
            .json()
            .await
            .map_err(|err| LedgerError::Malformed(err.to_string()))?;
        into_result(response)
    }

    pub async fn block_number(&self) -> LedgerResult<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        result
            .as_str()
            .and_then(parse_quantity)
            .ok_or_else(|| LedgerError::Malformed(format!("block number {result}")))
    }

    /// `None` when the node does not have the block (yet).
    pub async fn block_by_number(&self, number: u64, full: bool) -> LedgerResult<Option<Value>> {
        let result = self
            .call("eth_getBlockByNumber", json!([format_quantity(number), full]))
            .await?;
        Ok((!result.is_null()).then_some(result))
    }
}

fn into_result(response: JsonRpcResponse) -> LedgerResult<Value> {
    if let Some(err) = response.error {
        return Err(LedgerError::Rpc(format!("{} (code {})", err.message, err.code)));
    }
    response
        .result
        .ok_or_else(|| LedgerError::Malformed("response without result".to_owned()))
}

/// Block watcher over one node's HTTP and WebSocket endpoints.
pub struct EthJsonRpcClient {
    http: JsonRpcHttp,
    ws_url: String,
    max_batch: u64,
}

impl EthJsonRpcClient {
    pub fn new(http_url: impl Into<String>, ws_url: impl Into<String>, max_batch: u64) -> Self {
        Self {
            http: JsonRpcHttp::new(reqwest::Client::new(), http_url),
            ws_url: ws_url.into(),
            max_batch: max_batch.max(1),
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(
            config.ledger_http_url(),
            config.ledger_ws_url(),
            config.max_block_batch(),
        )
    }
}

/// Only whole-chain block watches exist on this ledger family.
fn ensure_supported(target: &WatchTarget) -> LedgerResult<()> {
    match target {
        WatchTarget::AllBlocks => Ok(()),
        other => Err(LedgerError::unknown_target(other)),
    }
}

/// Blocks to fetch for one poll: the tip alone on the first poll, otherwise
/// the next `max_batch` blocks after `cursor` that exist.
pub fn block_range(cursor: Option<u64>, tip: u64, max_batch: u64) -> Option<(u64, u64)> {
    match cursor {
        None => Some((tip, tip)),
        Some(cursor) if cursor >= tip => None,
        Some(cursor) => {
            let first = cursor + 1;
            let last = tip.min(cursor.saturating_add(max_batch.max(1)));
            Some((first, last))
        }
    }
}

/// `None` for blocks that cannot be sequenced; those are dropped so the rest
/// of the batch still flows.
fn block_event(requested: u64, block: Value) -> Option<RawLedgerEvent> {
    match block_number(&block) {
        Some(number) => Some(RawLedgerEvent::json(number, block)),
        None => {
            counter!("watch_events_dropped_total", "reason" => "malformed").increment(1);
            warn!(sequence = requested, "block without a number; skipping");
            None
        }
    }
}

#[async_trait]
impl PollLedgerClient for EthJsonRpcClient {
    async fn start_monitor(&self, target: &WatchTarget) -> LedgerResult<()> {
        ensure_supported(target)?;
        let tip = self.http.block_number().await?;
        debug!(tip, "ledger reachable");
        Ok(())
    }

    async fn list_since(
        &self,
        options: &SubscriptionOptions,
        cursor: Option<u64>,
    ) -> LedgerResult<Vec<RawLedgerEvent>> {
        ensure_supported(options.target())?;
        let tip = self.http.block_number().await?;
        let Some((first, last)) = block_range(cursor, tip, self.max_batch) else {
            return Ok(Vec::new());
        };

        let full = options.shape() == PayloadShape::FullBlock;
        let mut events = Vec::with_capacity((last - first + 1) as usize);
        for number in first..=last {
            match self.http.block_by_number(number, full).await? {
                Some(block) => events.extend(block_event(number, block)),
                None => break,
            }
        }
        Ok(events)
    }

    async fn advance_cursor(&self, _target: &WatchTarget, _cursor: u64) -> LedgerResult<()> {
        Ok(())
    }
}

#[async_trait]
impl PushLedgerClient for EthJsonRpcClient {
    async fn subscribe_native(
        &self,
        options: &SubscriptionOptions,
    ) -> LedgerResult<Box<dyn PushSubscription>> {
        ensure_supported(options.target())?;

        let (mut stream, _) = timeout(SUBSCRIBE_TIMEOUT, connect_async(self.ws_url.as_str()))
            .await
            .map_err(|_| LedgerError::Rpc("websocket connect timeout".to_owned()))?
            .map_err(LedgerError::from_source)?;

        let request = JsonRpcRequest::new(1, "eth_subscribe", json!(["newHeads"]));
        stream
            .send(Message::Text(encode(&request)?))
            .await
            .map_err(LedgerError::from_source)?;

        let subscription_id = timeout(SUBSCRIBE_TIMEOUT, await_subscription_id(&mut stream))
            .await
            .map_err(|_| LedgerError::Rpc("subscribe timeout".to_owned()))??;
        debug!(subscription = %subscription_id, "newHeads subscription established");

        let full_blocks =
            (options.shape() == PayloadShape::FullBlock).then(|| self.http.clone());
        Ok(Box::new(WsHeadSubscription {
            stream: Some(stream),
            subscription_id,
            full_blocks,
        }))
    }
}

fn encode<T: serde::Serialize>(request: &JsonRpcRequest<T>) -> LedgerResult<String> {
    serde_json::to_string(request).map_err(|err| LedgerError::Malformed(err.to_string()))
}

async fn await_subscription_id(stream: &mut WsStream) -> LedgerResult<String> {
    while let Some(message) = stream.next().await {
        let text = match message.map_err(LedgerError::from_source)? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let response: JsonRpcResponse =
            serde_json::from_str(&text).map_err(|err| LedgerError::Malformed(err.to_string()))?;
        let result = into_result(response)?;
        return result
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| LedgerError::Malformed(format!("subscription id {result}")));
    }
    Err(LedgerError::Closed)
}

/// `newHeads` subscription. With full blocks requested, each header is
/// resolved to its block over HTTP.
pub struct WsHeadSubscription {
    stream: Option<WsStream>,
    subscription_id: String,
    full_blocks: Option<JsonRpcHttp>,
}

async fn resolve(full_blocks: Option<&JsonRpcHttp>, number: u64, header: Value) -> Option<Value> {
    let Some(http) = full_blocks else {
        return Some(header);
    };
    match http.block_by_number(number, true).await {
        Ok(Some(block)) => Some(block),
        Ok(None) => {
            warn!(sequence = number, "announced block not available; skipping");
            None
        }
        Err(err) => {
            warn!(sequence = number, reason = %err, "full block fetch failed; skipping");
            None
        }
    }
}

#[async_trait]
impl PushSubscription for WsHeadSubscription {
    async fn next_event(&mut self) -> Option<LedgerResult<RawLedgerEvent>> {
        loop {
            let message = self.stream.as_mut()?.next().await;
            let text = match message {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => {
                    self.stream = None;
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    self.stream = None;
                    return Some(Err(LedgerError::from_source(err)));
                }
            };

            let notification: SubscriptionNotification = match serde_json::from_str(&text) {
                Ok(notification) => notification,
                Err(_) => {
                    debug!("ignoring non-notification frame");
                    continue;
                }
            };
            if notification.method != "eth_subscription"
                || notification.params.subscription != self.subscription_id
            {
                continue;
            }

            let header = notification.params.result;
            let Some(number) = block_number(&header) else {
                warn!("head notification without a block number; skipping");
                continue;
            };
            if let Some(payload) = resolve(self.full_blocks.as_ref(), number, header).await {
                return Some(Ok(RawLedgerEvent::json(number, payload)));
            }
        }
    }

    async fn unsubscribe(&mut self) -> LedgerResult<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let request = JsonRpcRequest::new(2, "eth_unsubscribe", json!([self.subscription_id]));
        let sent = match encode(&request) {
            Ok(text) => stream
                .send(Message::Text(text))
                .await
                .map_err(LedgerError::from_source),
            Err(err) => Err(err),
        };
        let _ = stream.close(None).await;
        sent
    }
}
