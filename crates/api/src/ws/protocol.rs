//! WatchBlocksV1 control frames. Event frames are `NormalizedEvent`s
//! serialized as they are.

use serde::{Deserialize, Serialize};

use ledger_watch_domain::{SessionId, SubscriptionOptions};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    Subscribe { options: SubscriptionOptions },
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Subscribed {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    Rejected {
        error: String,
    },
}

impl ServerMessage {
    pub fn rejected(error: impl ToString) -> Self {
        Self::Rejected {
            error: error.to_string(),
        }
    }
}
