use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use ledger_watch_domain::{
    error::WatchError, PushLedgerClient, PushSubscription, SessionSettings, SubscriptionOptions,
};

use super::{emit, spawn_producer, stop_requested, EventSource, SequenceGate, SourceEvent, SourceHandle};

/// Adapter over a ledger client's native subscription.
pub struct PushEventSource<C> {
    client: Arc<C>,
    settings: SessionSettings,
}

impl<C> PushEventSource<C>
where
    C: PushLedgerClient + 'static,
{
    pub fn new(client: Arc<C>, settings: SessionSettings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl<C> EventSource for PushEventSource<C>
where
    C: PushLedgerClient + 'static,
{
    fn mode(&self) -> &'static str {
        "push"
    }

    async fn start(&self, options: &SubscriptionOptions) -> Result<SourceHandle, WatchError> {
        options.validate()?;
        let subscription = self
            .client
            .subscribe_native(options)
            .await
            .map_err(WatchError::from_start_failure)?;

        let gate = SequenceGate::new(options.start_cursor());
        let target = options.target().to_string();
        info!(%target, "native subscription registered");

        Ok(spawn_producer(
            self.settings.channel_capacity,
            self.settings.teardown_timeout,
            move |tx, stop_rx| drive(subscription, tx, stop_rx, gate, target),
        ))
    }
}

async fn drive(
    mut subscription: Box<dyn PushSubscription>,
    tx: mpsc::Sender<SourceEvent>,
    mut stop_rx: watch::Receiver<bool>,
    mut gate: SequenceGate,
    target: String,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => break,
            item = subscription.next_event() => item,
        };

        match item {
            Some(Ok(event)) => {
                if !gate.admit(event.sequence) {
                    counter!("watch_events_dropped_total", "reason" => "duplicate").increment(1);
                    debug!(%target, sequence = ?event.sequence, "skipping already delivered sequence");
                    continue;
                }
                if emit(&tx, &mut stop_rx, SourceEvent::Raw(event)).await.is_err() {
                    break;
                }
            }
            Some(Err(err)) => {
                warn!(%target, reason = %err, "native subscription failed");
                let _ = emit(&tx, &mut stop_rx, SourceEvent::Failed(err.to_string())).await;
                break;
            }
            None => {
                info!(%target, "native subscription completed");
                let _ = emit(&tx, &mut stop_rx, SourceEvent::Completed).await;
                break;
            }
        }
    }

    match subscription.unsubscribe().await {
        Ok(()) => debug!(%target, "native subscription released"),
        Err(err) => warn!(%target, reason = %err, "native unsubscribe failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StopOutcome;
    use ledger_watch_domain::{LedgerError, LedgerResult, RawLedgerEvent, WatchTarget};
    use serde_json::json;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    type Feed = mpsc::UnboundedSender<LedgerResult<RawLedgerEvent>>;

    #[derive(Default)]
    struct MockClient {
        feed: Mutex<Option<mpsc::UnboundedReceiver<LedgerResult<RawLedgerEvent>>>>,
        unsubscribed: Arc<AtomicUsize>,
    }

    impl MockClient {
        fn with_feed() -> (Arc<Self>, Feed) {
            let (tx, rx) = mpsc::unbounded_channel();
            let client = Self {
                feed: Mutex::new(Some(rx)),
                ..Default::default()
            };
            (Arc::new(client), tx)
        }
    }

    struct MockSubscription {
        rx: mpsc::UnboundedReceiver<LedgerResult<RawLedgerEvent>>,
        unsubscribed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PushSubscription for MockSubscription {
        async fn next_event(&mut self) -> Option<LedgerResult<RawLedgerEvent>> {
            self.rx.recv().await
        }

        async fn unsubscribe(&mut self) -> LedgerResult<()> {
            self.unsubscribed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl PushLedgerClient for MockClient {
        async fn subscribe_native(
            &self,
            options: &SubscriptionOptions,
        ) -> LedgerResult<Box<dyn PushSubscription>> {
            if options.target() != &WatchTarget::AllBlocks {
                return Err(LedgerError::unknown_target(options.target()));
            }
            let rx = self.feed.lock().unwrap().take().ok_or(LedgerError::Closed)?;
            Ok(Box::new(MockSubscription {
                rx,
                unsubscribed: self.unsubscribed.clone(),
            }))
        }
    }

    fn block(n: u64) -> LedgerResult<RawLedgerEvent> {
        Ok(RawLedgerEvent::json(n, json!({"number": n})))
    }

    fn source(client: Arc<MockClient>) -> PushEventSource<MockClient> {
        PushEventSource::new(client, SessionSettings::default())
    }

    #[tokio::test]
    async fn forwards_events_and_suppresses_duplicates() {
        let (client, feed) = MockClient::with_feed();
        let options = SubscriptionOptions::new(WatchTarget::AllBlocks).with_start_cursor(5);
        let mut handle = source(client.clone()).start(&options).await.expect("starts");

        for n in [4, 5, 6, 6, 7] {
            feed.send(block(n)).unwrap();
        }
        drop(feed);

        let mut seen = Vec::new();
        while let Some(event) = handle.recv().await {
            match event {
                SourceEvent::Raw(raw) => seen.push(raw.sequence),
                SourceEvent::Completed => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, vec![Some(6), Some(7)]);
        handle.stop().await;
        assert_eq!(client.unsubscribed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscription_error_is_terminal() {
        let (client, feed) = MockClient::with_feed();
        let options = SubscriptionOptions::new(WatchTarget::AllBlocks);
        let mut handle = source(client.clone()).start(&options).await.unwrap();

        feed.send(block(1)).unwrap();
        feed.send(Err(LedgerError::Rpc("ConnectionReset".into()))).unwrap();
        feed.send(block(2)).unwrap();

        assert!(matches!(handle.recv().await, Some(SourceEvent::Raw(_))));
        match handle.recv().await {
            Some(SourceEvent::Failed(message)) => assert!(message.contains("ConnectionReset")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(handle.recv().await, None);
        assert_eq!(client.unsubscribed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_target_fails_fast() {
        let (client, _feed) = MockClient::with_feed();
        let options = SubscriptionOptions::new(WatchTarget::StateClass { name: "X".into() });
        let err = source(client.clone()).start(&options).await.unwrap_err();
        assert!(matches!(err, WatchError::Configuration(_)));
        assert_eq!(client.unsubscribed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_unsubscribes_exactly_once() {
        let (client, feed) = MockClient::with_feed();
        let options = SubscriptionOptions::new(WatchTarget::AllBlocks);
        let mut handle = source(client.clone()).start(&options).await.unwrap();

        assert_eq!(handle.stop().await, StopOutcome::Stopped);
        assert_eq!(handle.stop().await, StopOutcome::AlreadyStopped);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.unsubscribed.load(Ordering::SeqCst), 1);
        drop(feed);
    }
}
