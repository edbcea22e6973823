//! One subscriber's watch: drives an event source into an outbound channel
//! and tears both down exactly once.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::{
    runtime::Handle,
    sync::{mpsc, watch, Mutex as AsyncMutex, OnceCell},
    time::timeout,
};
use tracing::{debug, info, warn};

use ledger_watch_domain::{
    error::WatchError, CloseReason, NormalizedEvent, SessionId, SessionSettings, SessionState,
    SessionSummary, SubscriptionOptions,
};

use crate::{
    channel::{ControlSignal, OutboundChannel},
    pipeline::normalize_counted,
    source::{EventSource, SourceControl, SourceEvent, StopOutcome},
};

/// Shared handle to a running session. Clones refer to the same session.
#[derive(Clone)]
pub struct MonitorSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    options: SubscriptionOptions,
    channel: Arc<dyn OutboundChannel>,
    state: watch::Sender<SessionState>,
    control: AsyncMutex<Option<SourceControl>>,
    cancel: watch::Sender<bool>,
    delivery: AsyncMutex<()>,
    closed: OnceCell<CloseReason>,
    channel_closed: AtomicBool,
    last_delivered: Mutex<Option<u64>>,
    teardown_timeout: Duration,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    /// The session is closing; nothing was written.
    Skipped,
    Failed,
}

impl MonitorSession {
    pub async fn open(
        source: &dyn EventSource,
        options: SubscriptionOptions,
        channel: Arc<dyn OutboundChannel>,
        settings: &SessionSettings,
    ) -> Result<Self, WatchError> {
        Self::open_with_id(SessionId::generate(), source, options, channel, settings).await
    }

    /// Starts the source and begins delivery. A start failure leaves the
    /// session `Closed` and the channel untouched so the transport can report
    /// the error itself.
    pub async fn open_with_id(
        id: SessionId,
        source: &dyn EventSource,
        options: SubscriptionOptions,
        channel: Arc<dyn OutboundChannel>,
        settings: &SessionSettings,
    ) -> Result<Self, WatchError> {
        let session = Self::new(id, options, channel, settings.teardown_timeout);
        let target = session.inner.options.target().to_string();

        let handle = match source.start(&session.inner.options).await {
            Ok(handle) => handle,
            Err(err) => {
                session.transition(SessionState::Erroring);
                session.transition(SessionState::Closed);
                warn!(session_id = %session.id(), %target, reason = %err, "watch rejected");
                return Err(err);
            }
        };

        let (events, control) = handle.into_parts();
        *session.inner.control.lock().await = Some(control);
        session.transition(SessionState::Active);

        let registered = session
            .inner
            .channel
            .on_control_signal(control_callback(Arc::downgrade(&session.inner)));
        if let Err(err) = registered {
            warn!(session_id = %session.id(), reason = %err, "control plane unavailable");
            session.close(CloseReason::Transport).await;
            return Err(WatchError::Transport(err.to_string()));
        }

        info!(
            session_id = %session.id(),
            %target,
            mode = source.mode(),
            start_cursor = ?session.inner.options.start_cursor(),
            "watch session active"
        );
        tokio::spawn(session.clone().pump(events));
        Ok(session)
    }

    fn new(
        id: SessionId,
        options: SubscriptionOptions,
        channel: Arc<dyn OutboundChannel>,
        teardown_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                id,
                options,
                channel,
                state,
                control: AsyncMutex::new(None),
                cancel,
                delivery: AsyncMutex::new(()),
                closed: OnceCell::new(),
                channel_closed: AtomicBool::new(false),
                last_delivered: Mutex::new(None),
                teardown_timeout,
                created_at: Utc::now(),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.inner.options
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn last_delivered(&self) -> Option<u64> {
        *self
            .inner
            .last_delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reason the session closed with, once teardown has finished.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.closed.get().copied()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.inner.id.clone(),
            state: self.state(),
            target: self.inner.options.target().to_string(),
            last_delivered: self.last_delivered(),
            created_at: self.inner.created_at,
        }
    }

    /// Resolves once the session reaches `Closed`.
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| state.is_closed()).await;
    }

    /// Tears the session down. Every caller, concurrent or repeated, returns
    /// after the single teardown has finished; the first reason wins.
    pub async fn close(&self, reason: CloseReason) -> CloseReason {
        *self
            .inner
            .closed
            .get_or_init(|| self.teardown(reason))
            .await
    }

    async fn teardown(&self, reason: CloseReason) -> CloseReason {
        if let Some(closing) = reason.closing_state() {
            self.transition(closing);
        }
        self.inner.cancel.send_replace(true);

        let deadline = self.inner.teardown_timeout;
        if timeout(deadline, self.inner.delivery.lock()).await.is_err() {
            warn!(session_id = %self.id(), "in-flight delivery did not yield before teardown");
        }

        let control = self.inner.control.lock().await.take();
        if let Some(mut control) = control {
            if control.stop().await == StopOutcome::TimedOut {
                warn!(session_id = %self.id(), "event source force-released");
            }
        }

        self.close_channel().await;
        self.transition(SessionState::Closed);
        counter!("watch_sessions_closed_total", "reason" => reason.to_string()).increment(1);
        info!(
            session_id = %self.id(),
            %reason,
            last_delivered = ?self.last_delivered(),
            "watch session closed"
        );
        reason
    }

    async fn close_channel(&self) {
        if self.inner.channel_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if timeout(self.inner.teardown_timeout, self.inner.channel.close())
            .await
            .is_err()
        {
            warn!(session_id = %self.id(), "outbound channel close timed out");
        }
    }

    fn transition(&self, next: SessionState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn is_cancelled(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    async fn pump(self, mut events: mpsc::Receiver<SourceEvent>) {
        let mut cancel = self.inner.cancel.subscribe();
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.wait_for(|cancelled| *cancelled) => break,
                item = events.recv() => item,
            };

            match item {
                Some(SourceEvent::Raw(raw)) => {
                    let event = match normalize_counted(&raw, &self.inner.options) {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(
                                session_id = %self.id(),
                                sequence = ?raw.sequence,
                                reason = %err,
                                "dropping malformed event"
                            );
                            continue;
                        }
                    };
                    match self.deliver(event).await {
                        Delivery::Sent => {}
                        Delivery::Skipped => break,
                        Delivery::Failed => {
                            self.close(CloseReason::Transport).await;
                            break;
                        }
                    }
                }
                Some(SourceEvent::Failed(message)) => {
                    self.fail(message).await;
                    break;
                }
                Some(SourceEvent::Completed) => {
                    if self.deliver(NormalizedEvent::Complete).await == Delivery::Failed {
                        self.close(CloseReason::Transport).await;
                    } else {
                        self.close(CloseReason::Completed).await;
                    }
                    break;
                }
                None => {
                    if !self.is_cancelled() {
                        self.fail("event source ended unexpectedly".to_owned()).await;
                    }
                    break;
                }
            }
        }
        debug!(session_id = %self.id(), "delivery task finished");
    }

    async fn fail(&self, message: String) {
        if !self.transition(SessionState::Erroring) {
            return;
        }
        warn!(session_id = %self.id(), reason = %message, "watch failed upstream");
        let error = WatchError::StreamFatal(message);
        self.deliver(NormalizedEvent::error(error.to_string())).await;
        self.close(CloseReason::StreamFatal).await;
    }

    async fn deliver(&self, event: NormalizedEvent) -> Delivery {
        let _guard = self.inner.delivery.lock().await;
        if self.is_cancelled() {
            return Delivery::Skipped;
        }

        let mut cancel = self.inner.cancel.subscribe();
        let sequence = event.sequence();
        let sent = tokio::select! {
            biased;
            _ = cancel.wait_for(|cancelled| *cancelled) => return Delivery::Skipped,
            sent = self.inner.channel.send(event) => sent,
        };

        match sent {
            Ok(()) => {
                if let Some(sequence) = sequence {
                    *self
                        .inner
                        .last_delivered
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(sequence);
                }
                counter!("watch_events_delivered_total").increment(1);
                Delivery::Sent
            }
            Err(err) => {
                warn!(session_id = %self.id(), ?sequence, reason = %err, "outbound send failed");
                Delivery::Failed
            }
        }
    }
}

fn control_callback(session: Weak<SessionInner>) -> Box<dyn Fn(ControlSignal) + Send + Sync> {
    let runtime = Handle::current();
    Box::new(move |signal| {
        let Some(inner) = session.upgrade() else {
            return;
        };
        let session = MonitorSession { inner };
        debug!(session_id = %session.id(), %signal, "control signal received");
        runtime.spawn(async move {
            session.close(signal.into()).await;
        });
    })
}
