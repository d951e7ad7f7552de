//! Broadcast hub for session lifecycle notifications.
//!
//! Uses a single `tokio::sync::broadcast` channel. Every observer subscribes
//! and receives each notification once, in emission order.

use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Observers that fall behind skip
/// notifications (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 256;

/// A lifecycle notification emitted by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Initial connect succeeded.
    Connected { session_id: String },
    /// The connection dropped unexpectedly. Carries the id that was lost.
    Disconnected {
        session_id: Option<String>,
        reason: String,
    },
    /// A reconnect attempt is about to start (1-based).
    Reconnecting { attempt: u32 },
    /// A reconnect succeeded under a new session id.
    Reconnected { session_id: String },
    /// The retry predicate declined further attempts.
    ReconnectAbandoned { attempts: u32 },
    /// The broker reported an error outside request/response flow.
    AsyncError { message: String },
    /// `shutdown` completed.
    Closed,
}

/// Cloneable sender side of the lifecycle stream.
#[derive(Clone)]
pub struct SessionBroadcast {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    /// Each observer calls this once to get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn dispatch(&self, event: SessionEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }
}

impl Default for SessionBroadcast {
    fn default() -> Self {
        Self::new()
    }
}
