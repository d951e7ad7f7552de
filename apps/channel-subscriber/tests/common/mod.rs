#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use channel_subscriber::broker::frames::{
    ChannelPayload, ErrorCode, Frame, IdentifyPayload, SubscribePayload, OP_ACK, OP_CHANNEL_INFO,
    OP_HEARTBEAT, OP_HEARTBEAT_ACK, OP_IDENTIFY, OP_RESOLVE, OP_SUBSCRIBE, OP_UNSUBSCRIBE,
};
use channel_subscriber::error::HandlerError;
use channel_subscriber::session::{SessionEvent, SessionManager, SessionOptions};
use channel_subscriber::{BrokerTransport, Credentials, DeliveredEvent, Endpoint, Scheme};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn endpoint(host: &str) -> Endpoint {
    Endpoint::new(Scheme::Socket, host, 9000)
}

/// Session manager with short timings suitable for tests.
pub fn session_over(transport: Arc<dyn BrokerTransport>) -> Arc<SessionManager> {
    let mut options = SessionOptions::new(Credentials::new("tester"));
    options.connect_timeout = Duration::from_millis(500);
    options.reconnect_delay = Duration::from_millis(10);
    Arc::new(SessionManager::new(transport, options))
}

/// Poll `check` until it holds, failing the test after [`WAIT`].
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    time::timeout(WAIT, async {
        while !check() {
            time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Receive lifecycle events until one matches `want`; returns everything seen.
pub async fn events_until(
    rx: &mut broadcast::Receiver<SessionEvent>,
    want: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            let done = want(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for session event");
    seen
}

/// Handler that records every payload as a string.
#[derive(Clone, Default)]
pub struct Recorder(pub Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn handler(&self) -> impl FnMut(&[u8]) -> Result<(), HandlerError> + Send + 'static {
        let seen = Arc::clone(&self.0);
        move |payload: &[u8]| {
            seen.lock().push(String::from_utf8_lossy(payload).into_owned());
            Ok(())
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// `m0`, `m1`, ... for the given ids.
pub fn payloads(ids: impl IntoIterator<Item = i64>) -> Vec<String> {
    ids.into_iter().map(|id| format!("m{id}")).collect()
}

// ---------------------------------------------------------------------------
// WebSocket broker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct WsBrokerState {
    channels: HashMap<String, Vec<DeliveredEvent>>,
    clients: Vec<mpsc::UnboundedSender<Message>>,
    subscriptions: HashMap<String, mpsc::UnboundedSender<Message>>,
    denied_users: Vec<String>,
    sessions: u32,
    heartbeat_acks: u32,
}

/// A throwaway broker speaking the WebSocket frame protocol on 127.0.0.1.
pub struct WsTestBroker {
    pub addr: SocketAddr,
    state: Arc<Mutex<WsBrokerState>>,
}

impl WsTestBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(WsBrokerState::default()));

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_client(stream, Arc::clone(&accept_state)));
            }
        });

        Self { addr, state }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(Scheme::HttpTunnel, "127.0.0.1", self.addr.port())
    }

    pub fn create_channel(&self, name: &str) {
        self.state.lock().channels.insert(name.to_string(), Vec::new());
    }

    /// Append `m<id>` to the channel and push it to any subscriber.
    pub fn publish(&self, channel: &str) -> i64 {
        let mut state = self.state.lock();
        let events = state.channels.get_mut(channel).expect("unknown channel");
        let id = events.len() as i64;
        let event = DeliveredEvent::new(id, format!("m{id}"));
        events.push(event.clone());
        if let Some(client) = state.subscriptions.get(channel) {
            let _ = client.send(text(&Frame::dispatch(channel, &event)));
        }
        id
    }

    pub fn deny_user(&self, username: &str) {
        self.state.lock().denied_users.push(username.to_string());
    }

    /// Close every client connection from the broker side.
    pub fn kick_all(&self) {
        let mut state = self.state.lock();
        state.subscriptions.clear();
        for client in state.clients.drain(..) {
            let _ = client.send(Message::Close(None));
        }
    }

    pub fn push_error(&self, message: &str) {
        let frame = Frame::error(None, ErrorCode::Protocol, message);
        for client in &self.state.lock().clients {
            let _ = client.send(text(&frame));
        }
    }

    pub fn send_heartbeat(&self) {
        let frame = Frame::request(OP_HEARTBEAT, 99, serde_json::Value::Null);
        for client in &self.state.lock().clients {
            let _ = client.send(text(&frame));
        }
    }

    pub fn sessions(&self) -> u32 {
        self.state.lock().sessions
    }

    pub fn heartbeat_acks(&self) -> u32 {
        self.state.lock().heartbeat_acks
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.state.lock().subscriptions.contains_key(channel)
    }
}

fn text(frame: &Frame) -> Message {
    Message::Text(frame.encode().into())
}

async fn serve_client(stream: tokio::net::TcpStream, state: Arc<Mutex<WsBrokerState>>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if write.send(message).await.is_err() || is_close {
                break;
            }
        }
    });

    while let Some(Ok(message)) = read.next().await {
        let Message::Text(body) = message else {
            continue;
        };
        let Ok(frame) = Frame::decode(body.as_bytes()) else {
            continue;
        };
        let mut state = state.lock();

        match frame.op {
            OP_IDENTIFY => {
                let identify: IdentifyPayload = frame.payload().unwrap();
                if state.denied_users.contains(&identify.username) {
                    let _ = tx.send(text(&Frame::error(
                        None,
                        ErrorCode::PermissionDenied,
                        "user not authorised",
                    )));
                    continue;
                }
                state.sessions += 1;
                state.clients.push(tx.clone());
                let session_id = format!("ws-ses-{}", state.sessions);
                let _ = tx.send(text(&Frame::ready(&session_id)));
            }
            OP_RESOLVE => {
                let request: ChannelPayload = frame.payload().unwrap();
                let reply = match state.channels.get(&request.channel) {
                    Some(events) => Frame::reply(
                        OP_CHANNEL_INFO,
                        frame.n,
                        serde_json::json!({
                            "channel": request.channel,
                            "last_sequence_id": events.len() as i64 - 1,
                        }),
                    ),
                    None => Frame::error(frame.n, ErrorCode::ChannelNotFound, "no such channel"),
                };
                let _ = tx.send(text(&reply));
            }
            OP_SUBSCRIBE => {
                let request: SubscribePayload = frame.payload().unwrap();
                let Some(events) = state.channels.get(&request.channel) else {
                    let _ = tx.send(text(&Frame::error(
                        frame.n,
                        ErrorCode::ChannelNotFound,
                        "no such channel",
                    )));
                    continue;
                };
                for event in events.iter().filter(|e| e.sequence_id >= request.start) {
                    let _ = tx.send(text(&Frame::dispatch(&request.channel, event)));
                }
                state.subscriptions.insert(request.channel, tx.clone());
                let _ = tx.send(text(&Frame::reply(OP_ACK, frame.n, serde_json::Value::Null)));
            }
            OP_UNSUBSCRIBE => {
                let request: ChannelPayload = frame.payload().unwrap();
                state.subscriptions.remove(&request.channel);
                let _ = tx.send(text(&Frame::reply(OP_ACK, frame.n, serde_json::Value::Null)));
            }
            OP_HEARTBEAT_ACK => state.heartbeat_acks += 1,
            _ => {}
        }
    }
}
