//! In-process broker used by tests and local demos.
//!
//! Behaves like a remote broker from the session manager's point of view:
//! it assigns a fresh session id on every connect, forgets subscriptions when
//! the connection drops, and reports the loss over the signal channel.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    BrokerTransport, ByteCounts, ChannelInfo, Credentials, DeliverySink, SignalSender,
    TransportSignal,
};
use crate::endpoint::Endpoint;
use crate::error::{ConnectError, SubscribeError};
use crate::event::DeliveredEvent;

#[derive(Default)]
struct StoredChannel {
    events: BTreeMap<i64, DeliveredEvent>,
    next_id: i64,
}

impl StoredChannel {
    fn last_sequence_id(&self) -> i64 {
        self.next_id - 1
    }
}

struct Connection {
    session_id: String,
    signals: SignalSender,
}

struct ActiveSubscription {
    filter: Option<String>,
    sink: Arc<dyn DeliverySink>,
}

#[derive(Default)]
struct BrokerState {
    channels: HashMap<String, StoredChannel>,
    connection: Option<Connection>,
    subscriptions: HashMap<String, ActiveSubscription>,
    scripted_connects: VecDeque<ConnectError>,
    unreachable: HashSet<Endpoint>,
    denied_users: HashSet<String>,
    denied_channels: HashSet<String>,
    connect_count: u64,
}

/// An in-memory broker implementing [`BrokerTransport`].
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    /// Serialises deliveries so each sink sees one event at a time, in order.
    delivery: Mutex<()>,
    sent: AtomicU64,
    received: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty channel whose first event will get id `first_id`.
    pub fn create_channel(&self, name: &str, first_id: i64) {
        self.state.lock().channels.insert(
            name.to_string(),
            StoredChannel {
                events: BTreeMap::new(),
                next_id: first_id,
            },
        );
    }

    /// Append a payload to `channel` and return its sequence id.
    ///
    /// # Panics
    /// If the channel does not exist.
    pub fn publish(&self, channel: &str, payload: impl Into<Vec<u8>>) -> i64 {
        let _delivery = self.delivery.lock();
        let id = {
            let state = self.state.lock();
            state.channels.get(channel).expect("unknown channel").next_id
        };
        self.store_and_deliver(channel, DeliveredEvent::new(id, payload));
        id
    }

    /// Append a fully built event. Its sequence id must be past the channel's
    /// last id; ids skipped over are never delivered.
    ///
    /// # Panics
    /// If the channel does not exist or the id goes backwards.
    pub fn publish_event(&self, channel: &str, event: DeliveredEvent) {
        let _delivery = self.delivery.lock();
        self.store_and_deliver(channel, event);
    }

    /// Caller must hold the delivery lock.
    fn store_and_deliver(&self, channel: &str, event: DeliveredEvent) {
        let sink = {
            let mut state = self.state.lock();
            let stored = state.channels.get_mut(channel).expect("unknown channel");
            assert!(
                event.sequence_id >= stored.next_id,
                "sequence id {} is behind channel head {}",
                event.sequence_id,
                stored.next_id
            );
            stored.next_id = event.sequence_id + 1;
            stored.events.insert(event.sequence_id, event.clone());

            state
                .subscriptions
                .get(channel)
                .filter(|sub| filter_matches(sub.filter.as_deref(), &event))
                .map(|sub| Arc::clone(&sub.sink))
        };

        if let Some(sink) = sink {
            self.received
                .fetch_add(event.payload_len() as u64, Ordering::Relaxed);
            sink.on_event(&event);
        }
    }

    /// Remove stored events in `range`, as a broker-side purge would.
    pub fn purge(&self, channel: &str, range: RangeInclusive<i64>) {
        if let Some(stored) = self.state.lock().channels.get_mut(channel) {
            stored.events.retain(|id, _| !range.contains(id));
        }
    }

    /// Drop the physical connection as if the network failed.
    pub fn drop_connection(&self, reason: &str) {
        let connection = {
            let mut state = self.state.lock();
            state.subscriptions.clear();
            state.connection.take()
        };
        if let Some(connection) = connection {
            let _ = connection.signals.send(TransportSignal::ConnectionLost {
                reason: reason.to_string(),
            });
        }
    }

    /// Push an out-of-band error to the connected session.
    pub fn raise_async_error(&self, message: &str) {
        let state = self.state.lock();
        if let Some(connection) = &state.connection {
            let _ = connection
                .signals
                .send(TransportSignal::AsyncError(message.to_string()));
        }
    }

    /// Make the next connect attempts fail with these errors, in order.
    pub fn script_connect_failures(&self, errors: impl IntoIterator<Item = ConnectError>) {
        self.state.lock().scripted_connects.extend(errors);
    }

    pub fn set_unreachable(&self, endpoint: &Endpoint) {
        self.state.lock().unreachable.insert(endpoint.clone());
    }

    pub fn deny_user(&self, username: &str) {
        self.state.lock().denied_users.insert(username.to_string());
    }

    pub fn deny_channel(&self, channel: &str) {
        self.state.lock().denied_channels.insert(channel.to_string());
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state
            .lock()
            .connection
            .as_ref()
            .map(|c| c.session_id.clone())
    }

    pub fn connect_count(&self) -> u64 {
        self.state.lock().connect_count
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.state.lock().subscriptions.contains_key(channel)
    }

    fn count_request(&self, bytes: usize) {
        self.sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        signals: SignalSender,
    ) -> Result<String, ConnectError> {
        self.count_request(credentials.username.len() + credentials.client_name.len());

        let mut state = self.state.lock();
        if let Some(err) = state.scripted_connects.pop_front() {
            return Err(err);
        }
        if state.unreachable.contains(endpoint) {
            return Err(ConnectError::Unreachable {
                tried: endpoint.to_string(),
            });
        }
        if state.denied_users.contains(&credentials.username) {
            return Err(ConnectError::PermissionDenied(credentials.username.clone()));
        }

        let session_id = subscriber_common::id::prefixed_ulid(subscriber_common::id::prefix::SESSION);
        state.connection = Some(Connection {
            session_id: session_id.clone(),
            signals,
        });
        state.connect_count += 1;
        Ok(session_id)
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.subscriptions.clear();
        state.connection = None;
    }

    async fn resolve_channel(&self, name: &str) -> Result<ChannelInfo, SubscribeError> {
        self.count_request(name.len());

        let state = self.state.lock();
        if state.connection.is_none() {
            return Err(SubscribeError::SessionNotConnected);
        }
        let stored = state
            .channels
            .get(name)
            .ok_or_else(|| SubscribeError::ChannelNotFound {
                channel: name.to_string(),
            })?;
        Ok(ChannelInfo {
            name: name.to_string(),
            last_sequence_id: stored.last_sequence_id(),
        })
    }

    async fn subscribe(
        &self,
        channel: &str,
        filter: Option<&str>,
        start: i64,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<(), SubscribeError> {
        self.count_request(channel.len() + filter.map_or(0, str::len));

        let _delivery = self.delivery.lock();

        let backlog: Vec<DeliveredEvent> = {
            let mut state = self.state.lock();
            if state.connection.is_none() {
                return Err(SubscribeError::SessionNotConnected);
            }
            if state.denied_channels.contains(channel) {
                return Err(SubscribeError::PermissionDenied(channel.to_string()));
            }
            let stored = state
                .channels
                .get(channel)
                .ok_or_else(|| SubscribeError::ChannelNotFound {
                    channel: channel.to_string(),
                })?;
            let backlog = stored
                .events
                .range(start..)
                .map(|(_, event)| event)
                .filter(|event| filter_matches(filter, event))
                .cloned()
                .collect();

            state.subscriptions.insert(
                channel.to_string(),
                ActiveSubscription {
                    filter: filter.map(str::to_string),
                    sink: Arc::clone(&sink),
                },
            );
            backlog
        };

        for event in &backlog {
            self.received
                .fetch_add(event.payload_len() as u64, Ordering::Relaxed);
            sink.on_event(event);
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SubscribeError> {
        self.count_request(channel.len());
        self.state.lock().subscriptions.remove(channel);
        Ok(())
    }

    fn byte_counts(&self) -> ByteCounts {
        ByteCounts {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }
}

/// Evaluate a `name = 'value'` selector against the event tag (`tag`) or a
/// string property. Selectors in any other form match every event.
fn filter_matches(filter: Option<&str>, event: &DeliveredEvent) -> bool {
    let Some((name, value)) = filter.and_then(|f| f.split_once('=')) else {
        return true;
    };
    let name = name.trim();
    let value = value.trim().trim_matches('\'');

    if name == "tag" {
        return event.tag.as_deref() == Some(value);
    }
    event
        .properties
        .as_ref()
        .and_then(|props| props.get(name))
        .and_then(|v| v.as_str())
        == Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Scheme;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Collect(Mutex<Vec<i64>>);

    impl DeliverySink for Collect {
        fn on_event(&self, event: &DeliveredEvent) {
            self.0.lock().push(event.sequence_id);
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::new(Scheme::Socket, "localhost", 9000)
    }

    async fn connected_broker() -> (MemoryBroker, mpsc::UnboundedReceiver<TransportSignal>) {
        let broker = MemoryBroker::new();
        let (tx, rx) = mpsc::unbounded_channel();
        broker
            .connect(&endpoint(), &Credentials::new("tester"), tx)
            .await
            .unwrap();
        (broker, rx)
    }

    #[tokio::test]
    async fn each_connect_gets_a_new_session_id() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = broker
            .connect(&endpoint(), &Credentials::new("u"), tx.clone())
            .await
            .unwrap();
        let b = broker
            .connect(&endpoint(), &Credentials::new("u"), tx)
            .await
            .unwrap();
        assert!(a.starts_with("ses_"));
        assert_ne!(a, b);
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn subscribe_replays_backlog_from_start() {
        let (broker, _rx) = connected_broker().await;
        broker.create_channel("ch", 0);
        for i in 0..5 {
            broker.publish("ch", format!("m{i}"));
        }

        let sink = Arc::new(Collect::default());
        broker.subscribe("ch", None, 2, sink.clone()).await.unwrap();
        broker.publish("ch", "live");

        assert_eq!(*sink.0.lock(), vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn purged_events_are_not_replayed() {
        let (broker, _rx) = connected_broker().await;
        broker.create_channel("ch", 0);
        for _ in 0..4 {
            broker.publish("ch", "x");
        }
        broker.purge("ch", 1..=2);

        let sink = Arc::new(Collect::default());
        broker.subscribe("ch", None, 0, sink.clone()).await.unwrap();
        assert_eq!(*sink.0.lock(), vec![0, 3]);
    }

    #[tokio::test]
    async fn drop_connection_signals_and_forgets_subscriptions() {
        let (broker, mut rx) = connected_broker().await;
        broker.create_channel("ch", 0);
        let sink = Arc::new(Collect::default());
        broker.subscribe("ch", None, 0, sink).await.unwrap();

        broker.drop_connection("network down");

        assert!(!broker.is_subscribed("ch"));
        assert!(!broker.is_connected());
        assert_eq!(
            rx.recv().await,
            Some(TransportSignal::ConnectionLost {
                reason: "network down".to_string()
            })
        );
    }

    #[tokio::test]
    async fn selector_filters_on_tag() {
        let (broker, _rx) = connected_broker().await;
        broker.create_channel("ch", 0);
        let sink = Arc::new(Collect::default());
        broker
            .subscribe("ch", Some("tag = 'keep'"), 0, sink.clone())
            .await
            .unwrap();

        broker.publish_event("ch", DeliveredEvent::new(0, "a").with_tag("keep"));
        broker.publish_event("ch", DeliveredEvent::new(1, "b").with_tag("drop"));
        broker.publish_event("ch", DeliveredEvent::new(2, "c").with_tag("keep"));

        assert_eq!(*sink.0.lock(), vec![0, 2]);
    }

    #[tokio::test]
    async fn resolve_requires_connection() {
        let broker = MemoryBroker::new();
        broker.create_channel("ch", 0);
        assert_eq!(
            broker.resolve_channel("ch").await,
            Err(SubscribeError::SessionNotConnected)
        );
    }
}
