//! Session-ended notification
//!
//! Raised once per failed refresh batch so the hosting application can drop
//! whatever session state it holds and send the user back to sign-in.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::constants::SESSION_EVENT_CAPACITY;
use crate::refresh::RefreshFailure;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Ended { reason: RefreshFailure },
}

/// Receiver of the session-ended signal.
pub trait SessionObserver: Send + Sync {
    fn session_ended(&self, reason: &RefreshFailure);
}

/// Broadcasts session events to any number of subscribers.
#[derive(Clone)]
pub struct SessionSignal {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for SessionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionObserver for SessionSignal {
    fn session_ended(&self, reason: &RefreshFailure) {
        warn!(reason = %reason, "session ended, re-authentication required");
        let event = SessionEvent::Ended {
            reason: reason.clone(),
        };
        if self.tx.send(event).is_err() {
            debug!("no session subscribers");
        }
    }
}
