//! Hand-written ledger client doubles shared by the scenario tests.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use ledger_watch_domain::{
    LedgerError, LedgerResult, NormalizedEvent, PollLedgerClient, PushLedgerClient,
    PushSubscription, RawLedgerEvent, SubscriptionOptions, WatchTarget,
};
use ledger_watch_monitor::{ChannelError, ControlCallback, OutboundChannel};

pub type Feed = mpsc::UnboundedSender<LedgerResult<RawLedgerEvent>>;

pub fn block(n: u64) -> LedgerResult<RawLedgerEvent> {
    Ok(RawLedgerEvent::json(n, json!({"number": n, "hash": format!("0x{n:02x}")})))
}

pub fn raw_json(n: u64, payload: Value) -> LedgerResult<RawLedgerEvent> {
    Ok(RawLedgerEvent::json(n, payload))
}

/// Push client handing out one scripted subscription per `subscribe_native`.
#[derive(Default)]
pub struct MockPushClient {
    feeds: Mutex<Vec<mpsc::UnboundedReceiver<LedgerResult<RawLedgerEvent>>>>,
    unknown: Mutex<HashSet<WatchTarget>>,
    pub unsubscribes: Arc<AtomicUsize>,
    pub hang_unsubscribe: Arc<AtomicBool>,
}

impl MockPushClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a feed for the next subscription and returns its sender.
    pub fn feed(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().insert(0, rx);
        tx
    }

    pub fn reject(&self, target: WatchTarget) {
        self.unknown.lock().unwrap().insert(target);
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushLedgerClient for MockPushClient {
    async fn subscribe_native(
        &self,
        options: &SubscriptionOptions,
    ) -> LedgerResult<Box<dyn PushSubscription>> {
        if self.unknown.lock().unwrap().contains(options.target()) {
            return Err(LedgerError::unknown_target(options.target()));
        }
        let rx = self.feeds.lock().unwrap().pop().ok_or(LedgerError::Closed)?;
        Ok(Box::new(MockSubscription {
            rx,
            unsubscribes: self.unsubscribes.clone(),
            hang: self.hang_unsubscribe.clone(),
        }))
    }
}

struct MockSubscription {
    rx: mpsc::UnboundedReceiver<LedgerResult<RawLedgerEvent>>,
    unsubscribes: Arc<AtomicUsize>,
    hang: Arc<AtomicBool>,
}

#[async_trait]
impl PushSubscription for MockSubscription {
    async fn next_event(&mut self) -> Option<LedgerResult<RawLedgerEvent>> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> LedgerResult<()> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Poll client over a fixed list of items. Optionally ignores the cursor,
/// like a ledger-side queue that only forgets items once cleared.
pub struct MockPollClient {
    items: Mutex<Vec<RawLedgerEvent>>,
    honour_cursor: bool,
    list_delay: Duration,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub stops: AtomicUsize,
}

impl MockPollClient {
    pub fn new(honour_cursor: bool, list_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(Vec::new()),
            honour_cursor,
            list_delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, n: u64) {
        self.items
            .lock()
            .unwrap()
            .push(RawLedgerEvent::json(n, json!({"number": n})));
    }
}

#[async_trait]
impl PollLedgerClient for MockPollClient {
    async fn start_monitor(&self, target: &WatchTarget) -> LedgerResult<()> {
        match target {
            WatchTarget::Contract { .. } => Err(LedgerError::unknown_target(target)),
            _ => Ok(()),
        }
    }

    async fn list_since(
        &self,
        _options: &SubscriptionOptions,
        cursor: Option<u64>,
    ) -> LedgerResult<Vec<RawLedgerEvent>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        let items = self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|item| !self.honour_cursor || item.sequence > cursor)
            .cloned()
            .collect();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(items)
    }

    async fn advance_cursor(&self, _target: &WatchTarget, _cursor: u64) -> LedgerResult<()> {
        Ok(())
    }

    async fn stop_monitor(&self, _target: &WatchTarget) -> LedgerResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Outbound channel whose transport is gone: every send fails and it never
/// raises a control signal.
#[derive(Default)]
pub struct BrokenChannel {
    pub sends: AtomicUsize,
    pub closes: AtomicUsize,
}

#[async_trait]
impl OutboundChannel for BrokenChannel {
    async fn send(&self, _event: NormalizedEvent) -> Result<(), ChannelError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Err(ChannelError::Closed)
    }

    fn on_control_signal(&self, _callback: ControlCallback) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
