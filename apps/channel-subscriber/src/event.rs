//! Events delivered from a broker channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured, possibly nested, properties attached to an event.
pub type PropertyTree = Map<String, Value>;

/// Publisher-side metadata carried alongside an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Number of times the broker has redelivered this event (0 = first delivery).
    #[serde(default)]
    pub redelivered: u32,
}

/// A single event pushed by the broker.
///
/// Transports hand these to a [`DeliverySink`](crate::broker::DeliverySink) by
/// reference; a sink that needs the event after the callback returns must
/// clone it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveredEvent {
    /// Position in the channel. Monotonically increasing, never reused.
    pub sequence_id: i64,
    pub payload: Option<Vec<u8>>,
    pub end_of_channel: bool,
    pub tag: Option<String>,
    pub properties: Option<PropertyTree>,
    pub attributes: Option<EventAttributes>,
}

impl DeliveredEvent {
    /// Event with the given id and payload and no metadata.
    pub fn new(sequence_id: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sequence_id,
            payload: Some(payload.into()),
            ..Default::default()
        }
    }

    /// Event with no payload at all.
    pub fn empty(sequence_id: i64) -> Self {
        Self {
            sequence_id,
            ..Default::default()
        }
    }

    /// Payload length in bytes; an absent payload counts as zero.
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_attributes(mut self, attributes: EventAttributes) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn with_properties(mut self, properties: PropertyTree) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn at_end_of_channel(mut self) -> Self {
        self.end_of_channel = true;
        self
    }
}
