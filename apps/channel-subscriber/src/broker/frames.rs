//! Wire frames for the WebSocket broker tunnel.
//!
//! Every frame is a JSON object `{ op, t?, s?, n?, d }`: `op` selects the
//! frame kind, `t` and `s` carry the channel and sequence id of a DISPATCH,
//! and `n` is the nonce that pairs a request with its reply. Payload bytes
//! travel base64-encoded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::SubscribeError;
use crate::event::{DeliveredEvent, EventAttributes, PropertyTree};

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_SUBSCRIBE: u8 = 3;
pub const OP_UNSUBSCRIBE: u8 = 4;
pub const OP_RESOLVE: u8 = 5;
pub const OP_HEARTBEAT_ACK: u8 = 6;
pub const OP_RECONNECT: u8 = 7;
pub const OP_READY: u8 = 8;
pub const OP_CHANNEL_INFO: u8 = 9;
pub const OP_ERROR: u8 = 10;
pub const OP_ACK: u8 = 11;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid payload encoding: {0}")]
    Payload(#[from] base64::DecodeError),

    #[error("frame op {op} is missing {field}")]
    MissingField { op: u8, field: &'static str },
}

/// A single message in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u64>,
    #[serde(default)]
    pub d: Value,
}

impl Frame {
    pub fn new(op: u8, d: Value) -> Self {
        Self {
            op,
            t: None,
            s: None,
            n: None,
            d,
        }
    }

    /// A request the peer must answer with the same nonce.
    pub fn request(op: u8, nonce: u64, d: Value) -> Self {
        Self {
            n: Some(nonce),
            ..Self::new(op, d)
        }
    }

    /// A reply to the request carrying `nonce`.
    pub fn reply(op: u8, nonce: Option<u64>, d: Value) -> Self {
        Self {
            n: nonce,
            ..Self::new(op, d)
        }
    }

    pub fn identify(username: &str, password: Option<&str>, client_name: &str) -> Self {
        Self::new(
            OP_IDENTIFY,
            serde_json::json!(IdentifyPayload {
                username: username.to_string(),
                password: password.map(str::to_string),
                client_name: client_name.to_string(),
            }),
        )
    }

    pub fn ready(session_id: &str) -> Self {
        Self::new(
            OP_READY,
            serde_json::json!({ "session_id": session_id }),
        )
    }

    /// A DISPATCH carrying `event` on `channel`.
    pub fn dispatch(channel: &str, event: &DeliveredEvent) -> Self {
        let payload = DispatchPayload {
            data: event.payload.as_deref().map(|p| BASE64.encode(p)),
            end_of_channel: event.end_of_channel,
            tag: event.tag.clone(),
            properties: event.properties.clone(),
            attributes: event.attributes.clone(),
        };
        Self {
            t: Some(channel.to_string()),
            s: Some(event.sequence_id),
            ..Self::new(OP_DISPATCH, serde_json::json!(payload))
        }
    }

    pub fn error(nonce: Option<u64>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::reply(
            OP_ERROR,
            nonce,
            serde_json::json!(ErrorPayload {
                code,
                message: message.into(),
            }),
        )
    }

    pub fn encode(&self) -> String {
        // Frame holds only strings, integers and JSON values.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Deserialize `d` into a typed payload.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, FrameError> {
        Ok(T::deserialize(&self.d)?)
    }

    /// Split a DISPATCH frame into its channel and event.
    pub fn into_event(self) -> Result<(String, DeliveredEvent), FrameError> {
        let channel = self.t.clone().ok_or(FrameError::MissingField {
            op: self.op,
            field: "t",
        })?;
        let sequence_id = self.s.ok_or(FrameError::MissingField {
            op: self.op,
            field: "s",
        })?;
        let payload: DispatchPayload = self.payload()?;
        let data = payload.data.map(|d| BASE64.decode(d)).transpose()?;

        Ok((
            channel,
            DeliveredEvent {
                sequence_id,
                payload: data,
                end_of_channel: payload.end_of_channel,
                tag: payload.tag,
                properties: payload.properties,
                attributes: payload.attributes,
            },
        ))
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub client_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfoPayload {
    pub channel: String,
    pub last_sequence_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub start: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DispatchPayload {
    /// Base64 payload bytes; absent when the event has no payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default)]
    pub end_of_channel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<PropertyTree>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<EventAttributes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PermissionDenied,
    ChannelNotFound,
    NotConnected,
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
}

impl ErrorPayload {
    /// Map a broker refusal of a channel request for `channel`.
    pub fn into_subscribe_error(self, channel: &str) -> SubscribeError {
        match self.code {
            ErrorCode::ChannelNotFound => SubscribeError::ChannelNotFound {
                channel: channel.to_string(),
            },
            ErrorCode::PermissionDenied => SubscribeError::PermissionDenied(channel.to_string()),
            ErrorCode::NotConnected | ErrorCode::Protocol => SubscribeError::SessionNotConnected,
        }
    }
}
