//! Broker transport over a WebSocket tunnel (`nhp://` endpoints).
//!
//! One connection carries every request and every channel's events. A writer
//! task drains an outgoing queue into the socket; a reader task decodes
//! frames, completes pending requests by nonce and feeds DISPATCH frames to
//! the subscribed sink, one at a time, in arrival order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::frames::{
    ChannelInfoPayload, ChannelPayload, ErrorCode, ErrorPayload, Frame, ReadyPayload,
    SubscribePayload, OP_ACK, OP_CHANNEL_INFO, OP_DISPATCH, OP_ERROR, OP_HEARTBEAT,
    OP_HEARTBEAT_ACK, OP_READY, OP_RECONNECT, OP_RESOLVE, OP_SUBSCRIBE, OP_UNSUBSCRIBE,
};
use super::{
    BrokerTransport, ByteCounts, ChannelInfo, Credentials, DeliverySink, SignalSender,
    TransportSignal,
};
use crate::endpoint::{Endpoint, Scheme};
use crate::error::{ConnectError, SubscribeError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a channel request may wait for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    closing: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct WsShared {
    pending: DashMap<u64, oneshot::Sender<Frame>>,
    sinks: DashMap<String, Arc<dyn DeliverySink>>,
    next_nonce: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
}

impl WsShared {
    fn count_sent(&self, bytes: usize) {
        self.sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn count_received(&self, bytes: usize) {
        self.received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Forget everything tied to the current connection.
    fn reset(&self) {
        self.pending.clear();
        self.sinks.clear();
    }
}

pub struct WsTransport {
    shared: Arc<WsShared>,
    connection: Mutex<Option<Connection>>,
    request_timeout: Duration,
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(WsShared::default()),
            connection: Mutex::new(None),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url_for(endpoint: &Endpoint) -> Result<String, ConnectError> {
        match endpoint.scheme {
            Scheme::HttpTunnel => Ok(format!("ws://{}:{}/", endpoint.host, endpoint.port)),
            other => Err(ConnectError::Unreachable {
                tried: format!("{endpoint} ({} is not supported by this transport)", other.as_str()),
            }),
        }
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), SubscribeError> {
        let outgoing = self
            .connection
            .lock()
            .as_ref()
            .map(|c| c.outgoing.clone())
            .ok_or(SubscribeError::SessionNotConnected)?;
        let text = frame.encode();
        self.shared.count_sent(text.len());
        outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| SubscribeError::SessionNotConnected)
    }

    /// Send a request and wait for the frame answering it.
    async fn request(
        &self,
        op: u8,
        payload: serde_json::Value,
        channel: &str,
    ) -> Result<Frame, SubscribeError> {
        let nonce = self.shared.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(nonce, tx);

        if let Err(err) = self.send_frame(&Frame::request(op, nonce, payload)) {
            self.shared.pending.remove(&nonce);
            return Err(err);
        }

        let reply = match time::timeout(self.request_timeout, rx).await {
            Ok(Ok(frame)) => frame,
            // sender dropped: the connection went away
            Ok(Err(_)) => return Err(SubscribeError::SessionNotConnected),
            Err(_) => {
                self.shared.pending.remove(&nonce);
                tracing::warn!(op, nonce, %channel, "broker request timed out");
                return Err(SubscribeError::SessionNotConnected);
            }
        };

        if reply.op == OP_ERROR {
            let error: ErrorPayload = reply
                .payload()
                .map_err(|_| SubscribeError::SessionNotConnected)?;
            return Err(error.into_subscribe_error(channel));
        }
        Ok(reply)
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for WsTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        signals: SignalSender,
    ) -> Result<String, ConnectError> {
        let url = Self::url_for(endpoint)?;
        self.close().await;

        let (mut stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|err| map_handshake_error(endpoint, err))?;

        let identify = Frame::identify(
            &credentials.username,
            credentials.password.as_deref(),
            &credentials.client_name,
        )
        .encode();
        self.shared.count_sent(identify.len());
        stream
            .send(Message::Text(identify.into()))
            .await
            .map_err(|err| map_handshake_error(endpoint, err))?;

        let session_id = read_ready(&mut stream, &self.shared, endpoint).await?;

        let (write, read) = stream.split();
        let (outgoing, queue) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(write, queue));
        let reader = tokio::spawn(read_loop(
            read,
            Arc::clone(&self.shared),
            outgoing.clone(),
            signals,
            Arc::clone(&closing),
        ));

        *self.connection.lock() = Some(Connection {
            outgoing,
            closing,
            reader,
        });

        tracing::debug!(%endpoint, %session_id, "websocket session ready");
        Ok(session_id)
    }

    async fn close(&self) {
        let Some(connection) = self.connection.lock().take() else {
            return;
        };
        connection.closing.store(true, Ordering::SeqCst);
        let _ = connection.outgoing.send(Message::Close(None));
        connection.reader.abort();
        self.shared.reset();
    }

    async fn resolve_channel(&self, name: &str) -> Result<ChannelInfo, SubscribeError> {
        let reply = self
            .request(OP_RESOLVE, channel_payload(name), name)
            .await?;
        if reply.op != OP_CHANNEL_INFO {
            tracing::warn!(op = reply.op, "unexpected reply to RESOLVE");
            return Err(SubscribeError::SessionNotConnected);
        }
        let info: ChannelInfoPayload = reply
            .payload()
            .map_err(|_| SubscribeError::SessionNotConnected)?;
        Ok(ChannelInfo {
            name: info.channel,
            last_sequence_id: info.last_sequence_id,
        })
    }

    async fn subscribe(
        &self,
        channel: &str,
        filter: Option<&str>,
        start: i64,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<(), SubscribeError> {
        // Registered first: the broker streams backlog before it acknowledges.
        self.shared.sinks.insert(channel.to_string(), sink);

        let payload = serde_json::json!(SubscribePayload {
            channel: channel.to_string(),
            filter: filter.map(str::to_string),
            start,
        });
        match self.request(OP_SUBSCRIBE, payload, channel).await {
            Ok(reply) if reply.op == OP_ACK => Ok(()),
            Ok(reply) => {
                self.shared.sinks.remove(channel);
                tracing::warn!(op = reply.op, "unexpected reply to SUBSCRIBE");
                Err(SubscribeError::SessionNotConnected)
            }
            Err(err) => {
                self.shared.sinks.remove(channel);
                Err(err)
            }
        }
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SubscribeError> {
        self.shared.sinks.remove(channel);
        self.request(OP_UNSUBSCRIBE, channel_payload(channel), channel)
            .await
            .map(|_| ())
    }

    fn byte_counts(&self) -> ByteCounts {
        ByteCounts {
            sent: self.shared.sent.load(Ordering::Relaxed),
            received: self.shared.received.load(Ordering::Relaxed),
        }
    }
}

fn channel_payload(channel: &str) -> serde_json::Value {
    serde_json::json!(ChannelPayload {
        channel: channel.to_string(),
    })
}

fn map_handshake_error(endpoint: &Endpoint, err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Io(_) | tungstenite::Error::Url(_) => ConnectError::Unreachable {
            tried: endpoint.to_string(),
        },
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            ConnectError::PermissionDenied(format!("{endpoint} answered {}", response.status()))
        }
        other => ConnectError::ProtocolMismatch(other.to_string()),
    }
}

/// Wait for READY (or a refusal) after IDENTIFY.
async fn read_ready(
    stream: &mut WsStream,
    shared: &WsShared,
    endpoint: &Endpoint,
) -> Result<String, ConnectError> {
    loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => return Err(map_handshake_error(endpoint, err)),
            None => {
                return Err(ConnectError::Unreachable {
                    tried: endpoint.to_string(),
                })
            }
        };

        let frame = match message {
            Message::Text(text) => {
                shared.count_received(text.len());
                Frame::decode(text.as_bytes())
            }
            Message::Binary(bytes) => {
                shared.count_received(bytes.len());
                Frame::decode(&bytes)
            }
            Message::Close(_) => {
                return Err(ConnectError::Unreachable {
                    tried: endpoint.to_string(),
                })
            }
            _ => continue,
        }
        .map_err(|err| ConnectError::ProtocolMismatch(err.to_string()))?;

        return match frame.op {
            OP_READY => frame
                .payload::<ReadyPayload>()
                .map(|ready| ready.session_id)
                .map_err(|err| ConnectError::ProtocolMismatch(err.to_string())),
            OP_ERROR => {
                let error: ErrorPayload = frame
                    .payload()
                    .map_err(|err| ConnectError::ProtocolMismatch(err.to_string()))?;
                Err(match error.code {
                    ErrorCode::PermissionDenied => ConnectError::PermissionDenied(error.message),
                    _ => ConnectError::ProtocolMismatch(error.message),
                })
            }
            op => Err(ConnectError::ProtocolMismatch(format!(
                "expected READY, got op {op}"
            ))),
        };
    }
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut queue: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = queue.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if write.send(message).await.is_err() || is_close {
            break;
        }
    }
    let _ = write.close().await;
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    shared: Arc<WsShared>,
    outgoing: mpsc::UnboundedSender<Message>,
    signals: SignalSender,
    closing: Arc<AtomicBool>,
) {
    let reason = loop {
        let bytes = match read.next().await {
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or_else(
                    || "closed by broker".to_string(),
                    |f| format!("closed by broker: {}", &*f.reason),
                );
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => break err.to_string(),
            None => break "connection reset".to_string(),
        };
        shared.count_received(bytes.len());

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable frame");
                continue;
            }
        };

        match frame.op {
            OP_DISPATCH => deliver(&shared, frame),
            OP_HEARTBEAT => {
                let ack = Frame::reply(OP_HEARTBEAT_ACK, frame.n, serde_json::Value::Null).encode();
                shared.count_sent(ack.len());
                let _ = outgoing.send(Message::Text(ack.into()));
            }
            OP_RECONNECT => break "broker requested reconnect".to_string(),
            OP_ERROR if frame.n.is_none() => {
                let message = frame
                    .payload::<ErrorPayload>()
                    .map(|e| e.message)
                    .unwrap_or_else(|err| err.to_string());
                let _ = signals.send(TransportSignal::AsyncError(message));
            }
            _ => match frame.n.and_then(|n| shared.pending.remove(&n)) {
                Some((_, waiter)) => {
                    let _ = waiter.send(frame);
                }
                None => tracing::debug!(op = frame.op, "unsolicited frame"),
            },
        }
    };

    if closing.load(Ordering::SeqCst) {
        return;
    }
    shared.reset();
    tracing::debug!(%reason, "websocket connection lost");
    let _ = signals.send(TransportSignal::ConnectionLost { reason });
}

fn deliver(shared: &WsShared, frame: Frame) {
    let (channel, event) = match frame.into_event() {
        Ok(parts) => parts,
        Err(err) => {
            tracing::warn!(error = %err, "dropping malformed DISPATCH");
            return;
        }
    };
    let sink = shared.sinks.get(&channel).map(|entry| Arc::clone(entry.value()));
    match sink {
        Some(sink) => sink.on_event(&event),
        None => tracing::debug!(%channel, seq = event.sequence_id, "event for unsubscribed channel"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_http_tunnel_endpoints_are_supported() {
        let ok = WsTransport::url_for(&Endpoint::new(Scheme::HttpTunnel, "broker", 8080)).unwrap();
        assert_eq!(ok, "ws://broker:8080/");

        for scheme in [Scheme::Socket, Scheme::SecureSocket, Scheme::SecureHttpTunnel] {
            let err = WsTransport::url_for(&Endpoint::new(scheme, "broker", 1)).unwrap_err();
            assert!(matches!(err, ConnectError::Unreachable { .. }));
        }
    }

    #[tokio::test]
    async fn requests_fail_when_not_connected() {
        let transport = WsTransport::new();
        assert_eq!(
            transport.resolve_channel("c").await,
            Err(SubscribeError::SessionNotConnected)
        );
        assert_eq!(transport.byte_counts(), ByteCounts::default());
    }
}
