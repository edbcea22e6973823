//! Data structures shared across the monitor and API crates.

mod options;

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use serde::{ser::SerializeMap, Serialize, Serializer};
use serde_json::Value;
use strum_macros::{Display, EnumString};

pub use options::*;

/// Number of random bytes behind a generated session id.
pub const SESSION_ID_BYTES: usize = 16;

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque identifier of one subscriber's watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a random hex id. Falls back to a clock/counter mix when the
    /// OS entropy source is unavailable.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        if getrandom::fill(&mut bytes).is_err() {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos() as u64)
                .unwrap_or_default();
            let count = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
            bytes[..8].copy_from_slice(&nanos.to_be_bytes());
            bytes[8..].copy_from_slice(&count.to_be_bytes());
        }
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value.to_owned())
    }
}

/// Vendor payload as handed over by a ledger client.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Json(Value),
    Binary(Vec<u8>),
}

/// One item produced by an event source. Immutable once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLedgerEvent {
    pub sequence: Option<u64>,
    pub payload: RawPayload,
}

impl RawLedgerEvent {
    pub fn json(sequence: impl Into<Option<u64>>, payload: Value) -> Self {
        Self {
            sequence: sequence.into(),
            payload: RawPayload::Json(payload),
        }
    }

    pub fn binary(sequence: impl Into<Option<u64>>, payload: Vec<u8>) -> Self {
        Self {
            sequence: sequence.into(),
            payload: RawPayload::Binary(payload),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
pub enum EventKind {
    Next,
    Error,
    Complete,
}

/// Payload of a `Next` event after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Json(Value),
    Binary(Vec<u8>),
}

impl Serialize for EventPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EventPayload::Json(value) => value.serialize(serializer),
            EventPayload::Binary(bytes) => {
                serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
            }
        }
    }
}

/// Envelope delivered to the remote caller. A session emits at most one
/// terminal (`Error` or `Complete`) event and nothing after it.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    Next {
        sequence: Option<u64>,
        payload: EventPayload,
    },
    Error {
        message: String,
    },
    Complete,
}

impl NormalizedEvent {
    pub fn next(sequence: Option<u64>, payload: EventPayload) -> Self {
        Self::Next { sequence, payload }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Next { .. } => EventKind::Next,
            Self::Error { .. } => EventKind::Error,
            Self::Complete => EventKind::Complete,
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::Next { sequence, .. } => *sequence,
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Next { .. })
    }
}

impl Serialize for NormalizedEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", &self.kind())?;
        match self {
            Self::Next { sequence, payload } => {
                if let Some(sequence) = sequence {
                    map.serialize_entry("sequence", sequence)?;
                }
                map.serialize_entry("payload", payload)?;
            }
            Self::Error { message } => map.serialize_entry("message", message)?,
            Self::Complete => {}
        }
        map.end()
    }
}

/// Lifecycle of a monitor session.
///
/// `Created → Active → (Unsubscribing | Erroring) → Closed`, with `Closed`
/// terminal. Sessions that finish through upstream completion or an outbound
/// failure move straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SessionState {
    Created,
    Active,
    Unsubscribing,
    Erroring,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Created, Erroring)
                | (Created, Unsubscribing)
                | (Created, Closed)
                | (Active, Unsubscribing)
                | (Active, Erroring)
                | (Active, Closed)
                | (Unsubscribing, Closed)
                | (Erroring, Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CloseReason {
    Unsubscribe,
    Disconnect,
    Shutdown,
    StreamFatal,
    Transport,
    Completed,
}

impl CloseReason {
    /// Intermediate state entered before `Closed`, if any.
    pub fn closing_state(self) -> Option<SessionState> {
        match self {
            CloseReason::Unsubscribe | CloseReason::Disconnect | CloseReason::Shutdown => {
                Some(SessionState::Unsubscribing)
            }
            CloseReason::StreamFatal => Some(SessionState::Erroring),
            CloseReason::Transport | CloseReason::Completed => None,
        }
    }
}

/// Read-only view of a session for diagnostics endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: SessionState,
    pub target: String,
    pub last_delivered: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_session_ids_are_unique_hex() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), SESSION_ID_BYTES * 2);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn only_next_is_non_terminal() {
        let next = NormalizedEvent::next(Some(1), EventPayload::Json(json!({})));
        assert!(!next.is_terminal());
        assert!(NormalizedEvent::error("boom").is_terminal());
        assert!(NormalizedEvent::Complete.is_terminal());
        assert_eq!(next.sequence(), Some(1));
        assert_eq!(NormalizedEvent::Complete.sequence(), None);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let next = NormalizedEvent::next(Some(7), EventPayload::Binary(vec![0xde, 0xad]));
        assert_eq!(
            serde_json::to_value(&next).unwrap(),
            json!({"type": "Next", "sequence": 7, "payload": "0xdead"})
        );

        let err = NormalizedEvent::error("ConnectionReset");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"type": "Error", "message": "ConnectionReset"})
        );

        assert_eq!(
            serde_json::to_value(&NormalizedEvent::Complete).unwrap(),
            json!({"type": "Complete"})
        );
    }

    #[test]
    fn closed_is_terminal_state() {
        use SessionState::*;
        for next in [Created, Active, Unsubscribing, Erroring, Closed] {
            assert!(!Closed.can_transition_to(next));
        }
        assert!(Created.can_transition_to(Active));
        assert!(Active.can_transition_to(Erroring));
        assert!(Erroring.can_transition_to(Closed));
        assert!(!Unsubscribing.can_transition_to(Active));
        assert!(!Active.can_transition_to(Created));
    }

    #[test]
    fn close_reasons_map_to_intermediate_states() {
        assert_eq!(
            CloseReason::Unsubscribe.closing_state(),
            Some(SessionState::Unsubscribing)
        );
        assert_eq!(
            CloseReason::StreamFatal.closing_state(),
            Some(SessionState::Erroring)
        );
        assert_eq!(CloseReason::Transport.closing_state(), None);
        assert_eq!(CloseReason::Disconnect.to_string(), "disconnect");
    }
}
