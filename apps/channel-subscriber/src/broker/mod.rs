//! Broker transport abstraction.
//!
//! A transport owns the physical connection and pushes channel events into a
//! [`DeliverySink`]. Lifecycle notifications (connection loss, out-of-band
//! broker errors) travel back to the session manager over the signal channel
//! handed to [`BrokerTransport::connect`].

pub mod frames;
pub mod memory;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::endpoint::Endpoint;
use crate::error::{ConnectError, SubscribeError};
use crate::event::DeliveredEvent;

pub use memory::MemoryBroker;
pub use ws::WsTransport;

/// Identity presented to the broker when opening a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    /// Client name shown in broker-side session listings.
    pub client_name: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: None,
            client_name: subscriber_common::id::prefixed_ulid(subscriber_common::id::prefix::CLIENT),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Cumulative bytes moved over the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounts {
    pub sent: u64,
    pub received: u64,
}

/// Result of a channel lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    /// Id of the newest event currently stored on the channel.
    pub last_sequence_id: i64,
}

/// Out-of-band notification from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// The physical connection dropped without `close` being called.
    ConnectionLost { reason: String },
    /// The broker reported an error outside any request/response exchange.
    AsyncError(String),
}

pub type SignalSender = mpsc::UnboundedSender<TransportSignal>;

/// Receives events for one subscribed channel.
///
/// Transports call `on_event` for one event at a time, in increasing sequence
/// order, and do not read further events for the channel until it returns.
pub trait DeliverySink: Send + Sync {
    fn on_event(&self, event: &DeliveredEvent);

    /// Called each time the sink is (re)attached, with the first sequence id
    /// expected from the broker when it is known in advance.
    fn attached(&self, _channel: &str, _expected: Option<i64>) {}
}

/// Physical connection to a broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open a connection and return the broker-assigned session id.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        signals: SignalSender,
    ) -> Result<String, ConnectError>;

    /// Close the current connection, if any. Must not emit `ConnectionLost`.
    async fn close(&self);

    async fn resolve_channel(&self, name: &str) -> Result<ChannelInfo, SubscribeError>;

    /// Start delivering `channel` events with id `>= start` to `sink`.
    async fn subscribe(
        &self,
        channel: &str,
        filter: Option<&str>,
        start: i64,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<(), SubscribeError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), SubscribeError>;

    fn byte_counts(&self) -> ByteCounts;
}
