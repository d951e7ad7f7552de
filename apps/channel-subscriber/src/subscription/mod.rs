//! Channel resolution and the registry of active subscriptions.
//!
//! The registry outlives individual broker sessions: when the session manager
//! announces a reconnect, every active subscription is re-established on the
//! new session from its saved cursor.

mod handle;

use std::str::FromStr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::DeliverySink;
use crate::error::SubscribeError;
use crate::session::{SessionEvent, SessionManager};

pub use handle::ChannelHandle;

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// A specific sequence id.
    At(i64),
    /// The newest event on the channel at subscribe time. Gap detection
    /// starts from the first event actually delivered, not from the snapshot.
    Latest,
}

impl FromStr for StartPosition {
    type Err = String;

    /// Accepts `latest`, `-1` (latest) or a non-negative sequence id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        match s.parse::<i64>() {
            Ok(-1) => Ok(Self::Latest),
            Ok(id) if id >= 0 => Ok(Self::At(id)),
            Ok(_) => Err("sequence id must be -1 or non-negative".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[derive(Clone)]
struct Attached {
    handle: Arc<ChannelHandle>,
    sink: Arc<dyn DeliverySink>,
}

pub struct ChannelSubscriptions {
    session: Arc<SessionManager>,
    active: DashMap<String, Attached>,
}

impl ChannelSubscriptions {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            session,
            active: DashMap::new(),
        }
    }

    pub async fn resolve(&self, channel: &str) -> Result<Arc<ChannelHandle>, SubscribeError> {
        if !self.session.is_connected() {
            return Err(SubscribeError::SessionNotConnected);
        }
        let info = self.session.transport().resolve_channel(channel).await?;
        tracing::debug!(
            channel = %info.name,
            last_sequence_id = info.last_sequence_id,
            "channel resolved"
        );
        Ok(Arc::new(ChannelHandle::new(info.name, info.last_sequence_id)))
    }

    /// Attach `sink` to the channel. Returns the starting sequence id.
    ///
    /// Backlog at or after the start is delivered before this returns.
    pub async fn subscribe(
        &self,
        handle: &Arc<ChannelHandle>,
        filter: Option<&str>,
        start: StartPosition,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<i64, SubscribeError> {
        if !self.session.is_connected() {
            return Err(SubscribeError::SessionNotConnected);
        }
        let transport = self.session.transport();

        let (start, expected) = match start {
            StartPosition::At(id) => (id, Some(id)),
            // The newest event may already be gone by the time the broker
            // attaches; let the first delivery set the baseline.
            StartPosition::Latest => {
                let info = transport.resolve_channel(handle.name()).await?;
                (info.last_sequence_id, None)
            }
        };

        match self.active.entry(handle.name().to_string()) {
            Entry::Occupied(_) => {
                return Err(SubscribeError::AlreadySubscribed {
                    channel: handle.name().to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Attached {
                    handle: Arc::clone(handle),
                    sink: Arc::clone(&sink),
                });
            }
        }

        handle.set_filter(filter);
        handle.start_at(start);
        handle.set_active(true);
        sink.attached(handle.name(), expected);

        if let Err(err) = transport
            .subscribe(handle.name(), filter, start, Arc::clone(&sink))
            .await
        {
            handle.set_active(false);
            self.active.remove(handle.name());
            return Err(err);
        }

        tracing::info!(channel = %handle.name(), start, ?filter, "subscribed");
        Ok(start)
    }

    /// Detach from the channel. Unknown or already-detached handles are a no-op.
    pub async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<(), SubscribeError> {
        handle.set_active(false);
        if self.active.remove(handle.name()).is_none() {
            return Ok(());
        }

        if self.session.is_connected() {
            if let Err(err) = self.session.transport().unsubscribe(handle.name()).await {
                tracing::debug!(channel = %handle.name(), error = %err, "broker unsubscribe failed");
            }
        }
        tracing::info!(channel = %handle.name(), cursor = handle.cursor(), "unsubscribed");
        Ok(())
    }

    pub async fn unsubscribe_all(&self) {
        let handles: Vec<Arc<ChannelHandle>> = self
            .active
            .iter()
            .map(|entry| Arc::clone(&entry.value().handle))
            .collect();
        for handle in handles {
            // unsubscribe never fails
            let _ = self.unsubscribe(&handle).await;
        }
    }

    /// Deactivate and forget every subscription without talking to the
    /// broker. Used once the session is gone for good.
    pub fn release_all(&self) -> usize {
        let released: Vec<Arc<ChannelHandle>> = self
            .active
            .iter()
            .map(|entry| Arc::clone(&entry.value().handle))
            .collect();
        for handle in &released {
            handle.set_active(false);
            self.active.remove(handle.name());
        }
        released.len()
    }

    /// Re-establish every active subscription from its cursor on the current
    /// session. Returns how many succeeded.
    pub async fn reattach_all(&self) -> usize {
        let attached: Vec<Attached> = self
            .active
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let transport = self.session.transport();

        let mut reattached = 0;
        for Attached { handle, sink } in attached {
            if !handle.is_active() {
                continue;
            }
            let cursor = handle.cursor();
            let filter = handle.filter();
            sink.attached(handle.name(), Some(cursor));

            match transport
                .subscribe(handle.name(), filter.as_deref(), cursor, sink)
                .await
            {
                Ok(()) => {
                    reattached += 1;
                    tracing::info!(channel = %handle.name(), cursor, "subscription resumed");
                }
                Err(err) => {
                    tracing::warn!(
                        channel = %handle.name(),
                        cursor,
                        error = %err,
                        "failed to resume subscription"
                    );
                }
            }
        }
        reattached
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.active.contains_key(channel)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Spawn a task that resumes subscriptions after each reconnect. When the
    /// session is closed it releases every remaining subscription and exits.
    pub fn watch_session(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.session.subscribe_events();
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Reconnected { session_id }) => {
                        let resumed = registry.reattach_all().await;
                        tracing::info!(%session_id, resumed, "subscriptions reattached");
                    }
                    Ok(SessionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                        let released = registry.release_all();
                        if released > 0 {
                            tracing::info!(released, "subscriptions released on session close");
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "session watcher lagged");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_position_parsing() {
        assert_eq!("latest".parse::<StartPosition>(), Ok(StartPosition::Latest));
        assert_eq!("-1".parse::<StartPosition>(), Ok(StartPosition::Latest));
        assert_eq!(" 42 ".parse::<StartPosition>(), Ok(StartPosition::At(42)));
        assert!("-7".parse::<StartPosition>().is_err());
        assert!("soon".parse::<StartPosition>().is_err());
    }
}
