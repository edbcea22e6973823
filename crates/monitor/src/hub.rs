//! Registry of live sessions: the subscribe / unsubscribe / disconnect entry
//! points used by transports, plus process-wide shutdown.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::future::join_all;
use metrics::{counter, gauge};
use tracing::{debug, info};

use ledger_watch_domain::{
    error::WatchError, CloseReason, SessionId, SessionSettings, SessionSummary, SubscriptionOptions,
};

use crate::{channel::OutboundChannel, session::MonitorSession, source::EventSource};

type Registry = Arc<Mutex<HashMap<SessionId, MonitorSession>>>;

/// Caller-side reference to a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    id: SessionId,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }
}

#[derive(Clone)]
pub struct WatchHub {
    source: Arc<dyn EventSource>,
    settings: SessionSettings,
    sessions: Registry,
}

impl WatchHub {
    pub fn new(source: Arc<dyn EventSource>, settings: SessionSettings) -> Self {
        Self {
            source,
            settings,
            sessions: Arc::default(),
        }
    }

    pub fn mode(&self) -> &'static str {
        self.source.mode()
    }

    /// Opens a session delivering to `channel`. Invalid options and unknown
    /// targets are returned here and nothing is registered.
    pub async fn subscribe(
        &self,
        options: SubscriptionOptions,
        channel: Arc<dyn OutboundChannel>,
    ) -> Result<SessionHandle, WatchError> {
        let session =
            match MonitorSession::open(self.source.as_ref(), options, channel, &self.settings).await {
                Ok(session) => session,
                Err(err) => {
                    counter!("watch_sessions_total", "result" => "rejected").increment(1);
                    return Err(err);
                }
            };

        let id = session.id().clone();
        {
            let mut sessions = lock(&self.sessions);
            sessions.insert(id.clone(), session.clone());
            gauge!("watch_sessions_active").set(sessions.len() as f64);
        }
        counter!("watch_sessions_total", "result" => "opened").increment(1);

        let registry = self.sessions.clone();
        tokio::spawn(async move {
            session.wait_closed().await;
            let mut sessions = lock(&registry);
            sessions.remove(session.id());
            gauge!("watch_sessions_active").set(sessions.len() as f64);
            debug!(session_id = %session.id(), "session deregistered");
        });

        Ok(SessionHandle { id })
    }

    /// Returns `false` when the session is unknown or already gone.
    pub async fn unsubscribe(&self, handle: &SessionHandle) -> bool {
        self.close(handle, CloseReason::Unsubscribe).await
    }

    pub async fn on_disconnect(&self, handle: &SessionHandle) -> bool {
        self.close(handle, CloseReason::Disconnect).await
    }

    async fn close(&self, handle: &SessionHandle, reason: CloseReason) -> bool {
        let Some(session) = self.session(handle.id()) else {
            return false;
        };
        session.close(reason).await;
        true
    }

    pub fn session(&self, id: &SessionId) -> Option<MonitorSession> {
        lock(&self.sessions).get(id).cloned()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = lock(&self.sessions)
            .values()
            .map(MonitorSession::summary)
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub fn active_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Closes every live session and waits for all teardowns.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = lock(&self.sessions).values().cloned().collect();
        info!(sessions = sessions.len(), "closing all watch sessions");
        join_all(
            sessions
                .iter()
                .map(|session| session.close(CloseReason::Shutdown)),
        )
        .await;
    }
}

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<SessionId, MonitorSession>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
