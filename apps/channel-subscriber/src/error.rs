//! Error taxonomy for session, subscription, and dispatch failures.

use std::time::Duration;

use thiserror::Error;

/// Failure to establish the initial broker session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// No candidate endpoint answered.
    #[error("no broker endpoint reachable (tried: {tried})")]
    Unreachable { tried: String },

    /// The broker refused the supplied credentials.
    #[error("broker rejected the credentials: {0}")]
    PermissionDenied(String),

    /// The broker answered with something this client does not understand.
    #[error("unexpected response from broker: {0}")]
    ProtocolMismatch(String),

    /// A candidate accepted the connection but never completed the handshake.
    #[error("timed out after {0:?} waiting for the broker")]
    Timeout(Duration),

    /// `connect` was called on a manager that already ran it.
    #[error("session already initialised")]
    AlreadyInitialized,
}

impl ConnectError {
    /// Operator-facing hint printed before the process exits.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Unreachable { .. } => {
                "Ensure the broker is running and check the RNAME value."
            }
            Self::PermissionDenied(_) => {
                "The current user is not authorised to connect. Check the broker ACLs."
            }
            Self::ProtocolMismatch(_) => {
                "Ensure the broker and this client speak compatible protocol versions."
            }
            Self::Timeout(_) => {
                "The broker is busy or slow to respond. Increase CONNECT_TIMEOUT_SECS."
            }
            Self::AlreadyInitialized => "Only call connect once per session manager.",
        }
    }
}

/// Failure to resolve or attach to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("channel not found: {channel}")]
    ChannelNotFound { channel: String },

    #[error("session is not connected to the broker")]
    SessionNotConnected,

    #[error("insufficient permissions on channel: {0}")]
    PermissionDenied(String),

    /// A delivery sink is already registered for this handle.
    #[error("channel {channel} already has a delivery sink")]
    AlreadySubscribed { channel: String },
}

impl SubscribeError {
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::ChannelNotFound { .. } => "Check TOPIC_NAME against the channels on the broker.",
            Self::SessionNotConnected => {
                "The session is not physically connected. Ensure the broker is up."
            }
            Self::PermissionDenied(_) => "Check the ACL settings for this channel on the broker.",
            Self::AlreadySubscribed { .. } => "Unsubscribe the existing sink before attaching another.",
        }
    }
}

/// A fault raised by a message handler. Never fatal to the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Invalid or missing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} env var is required")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid endpoint {endpoint:?}: {reason}")]
    Endpoint { endpoint: String, reason: String },
}

/// Anything that stops a consumer from starting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
}

impl ConsumerError {
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Connect(e) => e.guidance(),
            Self::Subscribe(e) => e.guidance(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_error_delegates_guidance() {
        let err = ConsumerError::from(ConnectError::Timeout(Duration::from_secs(3)));
        assert_eq!(err.guidance(), ConnectError::Timeout(Duration::ZERO).guidance());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn subscribe_error_messages_name_the_channel() {
        let err = SubscribeError::ChannelNotFound {
            channel: "orders".to_string(),
        };
        assert_eq!(err.to_string(), "channel not found: orders");
    }
}
