use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use metrics::counter;
use tokio::{
    sync::{mpsc, watch},
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use ledger_watch_domain::{
    error::WatchError, LedgerError, PollLedgerClient, SessionSettings, SubscriptionOptions,
};

use super::{emit, spawn_producer, stop_requested, EventSource, SequenceGate, SourceEvent, SourceHandle};

const MIN_POLL_PERIOD: Duration = Duration::from_millis(1);

/// Adapter that turns a "list since cursor" operation into an event stream.
///
/// One poll runs at a time per handle. Ticks that fire while a poll is still
/// in flight are skipped, never queued. The cursor moves as soon as an item
/// has been handed to the session, whether or not the remote caller ever
/// acknowledges it; the ledger-side clear is best effort and retried on the
/// next tick.
pub struct PollEventSource<C> {
    client: Arc<C>,
    settings: SessionSettings,
}

impl<C> PollEventSource<C>
where
    C: PollLedgerClient + 'static,
{
    pub fn new(client: Arc<C>, settings: SessionSettings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl<C> EventSource for PollEventSource<C>
where
    C: PollLedgerClient + 'static,
{
    fn mode(&self) -> &'static str {
        "poll"
    }

    async fn start(&self, options: &SubscriptionOptions) -> Result<SourceHandle, WatchError> {
        options.validate()?;
        self.client
            .start_monitor(options.target())
            .await
            .map_err(WatchError::from_start_failure)?;

        let period = options.poll_interval().unwrap_or(self.settings.poll_interval);
        info!(
            target = %options.target(),
            poll_interval_ms = period.as_millis() as u64,
            "poll monitor started"
        );

        let state = PollLoop {
            client: self.client.clone(),
            options: options.clone(),
            gate: SequenceGate::new(options.start_cursor()),
            cleared: options.start_cursor(),
            period: period.max(MIN_POLL_PERIOD),
            max_failures: self.settings.max_poll_failures.max(1),
        };

        Ok(spawn_producer(
            self.settings.channel_capacity,
            self.settings.teardown_timeout,
            move |tx, stop_rx| state.run(tx, stop_rx),
        ))
    }
}

enum TickOutcome {
    Continue,
    Finished,
}

struct PollLoop<C> {
    client: Arc<C>,
    options: SubscriptionOptions,
    gate: SequenceGate,
    cleared: Option<u64>,
    period: Duration,
    max_failures: u32,
}

impl<C> PollLoop<C>
where
    C: PollLedgerClient + 'static,
{
    async fn run(mut self, tx: mpsc::Sender<SourceEvent>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop_rx) => break,
                _ = ticker.tick() => {}
            }

            match self.tick(&tx, &mut stop_rx).await {
                Ok(TickOutcome::Continue) => {
                    counter!("watch_poll_ticks_total", "result" => "ok").increment(1);
                    failures = 0;
                }
                Ok(TickOutcome::Finished) => break,
                Err(LedgerError::Malformed(reason)) => {
                    counter!("watch_poll_ticks_total", "result" => "malformed").increment(1);
                    warn!(
                        target = %self.options.target(),
                        %reason,
                        "malformed listing dropped; retrying on next tick"
                    );
                }
                Err(err) => {
                    counter!("watch_poll_ticks_total", "result" => "error").increment(1);
                    failures += 1;
                    let terminal = matches!(err, LedgerError::UnknownTarget(_) | LedgerError::Closed)
                        || failures >= self.max_failures;
                    if terminal {
                        warn!(
                            target = %self.options.target(),
                            failures,
                            reason = %err,
                            "poll source failed"
                        );
                        let _ = emit(&tx, &mut stop_rx, SourceEvent::Failed(err.to_string())).await;
                        break;
                    }
                    warn!(
                        target = %self.options.target(),
                        failures,
                        reason = %err,
                        "poll failed; retrying on next tick"
                    );
                }
            }
        }

        if let Err(err) = self.client.stop_monitor(self.options.target()).await {
            warn!(target = %self.options.target(), reason = %err, "stop monitor failed");
        }
    }

    async fn tick(
        &mut self,
        tx: &mpsc::Sender<SourceEvent>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<TickOutcome, LedgerError> {
        let mut items = tokio::select! {
            biased;
            _ = stop_requested(stop_rx) => return Ok(TickOutcome::Finished),
            listed = self.client.list_since(&self.options, self.gate.last()) => listed?,
        };
        items.sort_by_key(|item| item.sequence);

        for item in items {
            if item.sequence.is_none() {
                counter!("watch_events_dropped_total", "reason" => "unsequenced").increment(1);
                warn!(target = %self.options.target(), "dropping poll item without a sequence marker");
                continue;
            }
            // Admitting ahead of emit is safe: a failed emit ends the handle.
            if !self.gate.admit(item.sequence) {
                counter!("watch_events_dropped_total", "reason" => "duplicate").increment(1);
                debug!(sequence = ?item.sequence, "skipping already delivered sequence");
                continue;
            }
            if emit(tx, stop_rx, SourceEvent::Raw(item)).await.is_err() {
                return Ok(TickOutcome::Finished);
            }
        }

        self.clear_delivered().await;
        Ok(TickOutcome::Continue)
    }

    async fn clear_delivered(&mut self) {
        let Some(cursor) = self.gate.last() else {
            return;
        };
        if self.cleared == Some(cursor) {
            return;
        }
        match self.client.advance_cursor(self.options.target(), cursor).await {
            Ok(()) => self.cleared = Some(cursor),
            Err(err) => warn!(
                target = %self.options.target(),
                cursor,
                reason = %err,
                "clearing delivered items failed; retrying on next tick"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StopOutcome;
    use ledger_watch_domain::{LedgerResult, RawLedgerEvent, WatchTarget};
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };

    /// Ledger queue in the style of a vault-tracking monitor: items stay
    /// listed until cleared.
    #[derive(Default)]
    struct MockQueue {
        items: Mutex<Vec<RawLedgerEvent>>,
        cursors_seen: Mutex<Vec<Option<u64>>>,
        cleared: Mutex<Vec<u64>>,
        fail_clear: AtomicBool,
        fail_list: AtomicBool,
        stops: AtomicUsize,
        malformed_listings: AtomicUsize,
    }

    impl MockQueue {
        fn push(&self, n: u64) {
            self.items
                .lock()
                .unwrap()
                .push(RawLedgerEvent::json(n, json!({"index": n})));
        }
    }

    #[async_trait]
    impl PollLedgerClient for MockQueue {
        async fn start_monitor(&self, target: &WatchTarget) -> LedgerResult<()> {
            match target {
                WatchTarget::StateClass { name } if name == "known.State" => Ok(()),
                other => Err(LedgerError::unknown_target(other)),
            }
        }

        async fn list_since(
            &self,
            _options: &SubscriptionOptions,
            cursor: Option<u64>,
        ) -> LedgerResult<Vec<RawLedgerEvent>> {
            self.cursors_seen.lock().unwrap().push(cursor);
            if self
                .malformed_listings
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                return Err(LedgerError::Malformed("block without a number".into()));
            }
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(LedgerError::Rpc("node unreachable".into()));
            }
            // Deliberately ignores the cursor; the adapter must not re-emit.
            let mut items = self.items.lock().unwrap().clone();
            items.reverse();
            Ok(items)
        }

        async fn advance_cursor(&self, _target: &WatchTarget, cursor: u64) -> LedgerResult<()> {
            if self.fail_clear.load(Ordering::SeqCst) {
                return Err(LedgerError::Rpc("clear rejected".into()));
            }
            self.cleared.lock().unwrap().push(cursor);
            self.items
                .lock()
                .unwrap()
                .retain(|item| item.sequence.is_some_and(|seq| seq > cursor));
            Ok(())
        }

        async fn stop_monitor(&self, _target: &WatchTarget) -> LedgerResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn options() -> SubscriptionOptions {
        SubscriptionOptions::new(WatchTarget::StateClass {
            name: "known.State".into(),
        })
        .with_poll_interval(Duration::from_millis(100))
    }

    fn source(queue: Arc<MockQueue>) -> PollEventSource<MockQueue> {
        PollEventSource::new(queue, SessionSettings::default())
    }

    async fn next_sequence(handle: &mut SourceHandle) -> Option<u64> {
        match handle.recv().await {
            Some(SourceEvent::Raw(raw)) => raw.sequence,
            other => panic!("expected raw event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_in_ascending_order_and_clears_after_emission() {
        let queue = Arc::new(MockQueue::default());
        for n in [1, 2, 3] {
            queue.push(n);
        }
        let mut handle = source(queue.clone()).start(&options()).await.unwrap();

        assert_eq!(next_sequence(&mut handle).await, Some(1));
        assert_eq!(next_sequence(&mut handle).await, Some(2));
        assert_eq!(next_sequence(&mut handle).await, Some(3));

        queue.push(4);
        assert_eq!(next_sequence(&mut handle).await, Some(4));

        assert_eq!(handle.stop().await, StopOutcome::Stopped);
        assert_eq!(queue.cleared.lock().unwrap().first(), Some(&3));
        assert_eq!(queue.stops.load(Ordering::SeqCst), 1);
    }

    // The cursor advances after the emission attempt even when the ledger
    // refuses the clear, so a repeated listing of the same items (cursor
    // unchanged upstream) never re-delivers them.
    #[tokio::test(start_paused = true)]
    async fn failed_clear_never_causes_redelivery() {
        let queue = Arc::new(MockQueue::default());
        queue.fail_clear.store(true, Ordering::SeqCst);
        queue.push(1);
        queue.push(2);
        let mut handle = source(queue.clone()).start(&options()).await.unwrap();

        assert_eq!(next_sequence(&mut handle).await, Some(1));
        assert_eq!(next_sequence(&mut handle).await, Some(2));

        tokio::time::sleep(Duration::from_millis(350)).await;
        queue.push(3);
        assert_eq!(next_sequence(&mut handle).await, Some(3));

        assert!(queue.cleared.lock().unwrap().is_empty());
        queue.fail_clear.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.cleared.lock().unwrap().last(), Some(&3));

        handle.stop().await;
        assert!(queue.cursors_seen.lock().unwrap().len() >= 4);
    }

    #[tokio::test]
    async fn unknown_state_class_fails_start() {
        let queue = Arc::new(MockQueue::default());
        let options = SubscriptionOptions::new(WatchTarget::StateClass {
            name: "missing.State".into(),
        });
        let err = source(queue.clone()).start(&options).await.unwrap_err();
        assert!(matches!(err, WatchError::Configuration(_)));
        assert_eq!(queue.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_list_failures_become_terminal() {
        let queue = Arc::new(MockQueue::default());
        queue.fail_list.store(true, Ordering::SeqCst);
        let settings = SessionSettings {
            max_poll_failures: 2,
            ..SessionSettings::default()
        };
        let mut handle = PollEventSource::new(queue.clone(), settings)
            .start(&options())
            .await
            .unwrap();

        match handle.recv().await {
            Some(SourceEvent::Failed(message)) => assert!(message.contains("node unreachable")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(handle.recv().await, None);
        assert_eq!(queue.cursors_seen.lock().unwrap().len(), 2);
        assert_eq!(queue.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsequenced_items_are_dropped() {
        let queue = Arc::new(MockQueue::default());
        queue
            .items
            .lock()
            .unwrap()
            .push(RawLedgerEvent::json(None, json!({"orphan": true})));
        queue.push(7);
        let mut handle = source(queue.clone()).start(&options()).await.unwrap();

        assert_eq!(next_sequence(&mut handle).await, Some(7));
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_listings_never_end_the_stream() {
        let queue = Arc::new(MockQueue::default());
        queue.malformed_listings.store(5, Ordering::SeqCst);
        queue.push(1);
        let settings = SessionSettings {
            max_poll_failures: 2,
            ..SessionSettings::default()
        };
        let mut handle = PollEventSource::new(queue.clone(), settings)
            .start(&options())
            .await
            .unwrap();

        assert_eq!(next_sequence(&mut handle).await, Some(1));
        assert!(queue.cursors_seen.lock().unwrap().len() >= 6);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_still_polls() {
        let queue = Arc::new(MockQueue::default());
        queue.push(1);
        let settings = SessionSettings {
            poll_interval: Duration::ZERO,
            ..SessionSettings::default()
        };
        let options = SubscriptionOptions::new(WatchTarget::StateClass {
            name: "known.State".into(),
        });
        let mut handle = PollEventSource::new(queue.clone(), settings)
            .start(&options)
            .await
            .unwrap();

        assert_eq!(next_sequence(&mut handle).await, Some(1));
        assert_eq!(handle.stop().await, StopOutcome::Stopped);
    }
}
