mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time;

use channel_subscriber::broker::{TransportSignal, WsTransport};
use channel_subscriber::session::SessionEvent;
use channel_subscriber::{
    BrokerTransport, ChannelConsumer, ConnectError, ConsumerOptions, Credentials, DeliveredEvent,
    DeliverySink, Endpoint, Scheme, StartPosition, SubscribeError,
};

use common::{events_until, payloads, session_over, wait_until, Recorder, WsTestBroker, WAIT};

#[derive(Default)]
struct Collect(Mutex<Vec<DeliveredEvent>>);

impl DeliverySink for Collect {
    fn on_event(&self, event: &DeliveredEvent) {
        self.0.lock().push(event.clone());
    }
}

impl Collect {
    fn ids(&self) -> Vec<i64> {
        self.0.lock().iter().map(|e| e.sequence_id).collect()
    }
}

#[tokio::test]
async fn identify_resolve_subscribe_and_stream() {
    let broker = WsTestBroker::start().await;
    broker.create_channel("orders");
    for _ in 0..3 {
        broker.publish("orders");
    }

    let transport = WsTransport::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let session_id = transport
        .connect(&broker.endpoint(), &Credentials::new("tester"), tx)
        .await
        .unwrap();
    assert_eq!(session_id, "ws-ses-1");

    let info = transport.resolve_channel("orders").await.unwrap();
    assert_eq!(info.last_sequence_id, 2);

    let sink = Arc::new(Collect::default());
    transport
        .subscribe("orders", None, 1, sink.clone())
        .await
        .unwrap();
    // backlog arrives before the acknowledgement
    assert_eq!(sink.ids(), vec![1, 2]);

    broker.publish("orders");
    broker.publish("orders");
    wait_until(|| sink.ids().len() == 4).await;
    assert_eq!(sink.ids(), vec![1, 2, 3, 4]);
    assert_eq!(
        sink.0.lock()[3].payload.as_deref(),
        Some(&b"m4"[..])
    );

    let bytes = transport.byte_counts();
    assert!(bytes.sent > 0);
    assert!(bytes.received > bytes.sent);

    transport.unsubscribe("orders").await.unwrap();
    wait_until(|| !broker.is_subscribed("orders")).await;
}

#[tokio::test]
async fn unknown_channel_is_reported() {
    let broker = WsTestBroker::start().await;
    let transport = WsTransport::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    transport
        .connect(&broker.endpoint(), &Credentials::new("tester"), tx)
        .await
        .unwrap();

    assert_eq!(
        transport.resolve_channel("ghost").await.unwrap_err(),
        SubscribeError::ChannelNotFound {
            channel: "ghost".to_string()
        }
    );
}

#[tokio::test]
async fn refused_identify_is_permission_denied() {
    let broker = WsTestBroker::start().await;
    broker.deny_user("intruder");
    let transport = WsTransport::new();
    let (tx, _rx) = mpsc::unbounded_channel();

    let err = transport
        .connect(&broker.endpoint(), &Credentials::new("intruder"), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::PermissionDenied(_)));
}

#[tokio::test]
async fn closed_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = WsTransport::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = transport
        .connect(
            &Endpoint::new(Scheme::HttpTunnel, "127.0.0.1", port),
            &Credentials::new("tester"),
            tx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::Unreachable { .. }));
}

#[tokio::test]
async fn broker_side_close_signals_connection_lost() {
    let broker = WsTestBroker::start().await;
    let transport = WsTransport::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .connect(&broker.endpoint(), &Credentials::new("tester"), tx)
        .await
        .unwrap();

    broker.kick_all();
    let signal = time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(signal, TransportSignal::ConnectionLost { .. }));
}

#[tokio::test]
async fn client_close_is_silent() {
    let broker = WsTestBroker::start().await;
    let transport = WsTransport::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .connect(&broker.endpoint(), &Credentials::new("tester"), tx)
        .await
        .unwrap();

    transport.close().await;
    time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(
        transport.resolve_channel("orders").await.unwrap_err(),
        SubscribeError::SessionNotConnected
    );
}

#[tokio::test]
async fn out_of_band_errors_and_heartbeats() {
    let broker = WsTestBroker::start().await;
    let transport = WsTransport::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .connect(&broker.endpoint(), &Credentials::new("tester"), tx)
        .await
        .unwrap();

    broker.push_error("queue overflow");
    let signal = time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        signal,
        TransportSignal::AsyncError("queue overflow".to_string())
    );

    broker.send_heartbeat();
    wait_until(|| broker.heartbeat_acks() == 1).await;
}

#[tokio::test]
async fn consumer_resumes_over_websocket_after_kick() {
    let broker = WsTestBroker::start().await;
    broker.create_channel("orders");

    let session = session_over(Arc::new(WsTransport::new()));
    let mut events = session.subscribe_events();
    let recorder = Recorder::default();
    let options = ConsumerOptions {
        start: StartPosition::At(0),
        log_level: 0,
        ..ConsumerOptions::new(vec![broker.endpoint()], "orders")
    };
    let consumer = ChannelConsumer::start(session.clone(), &options, recorder.handler())
        .await
        .unwrap();

    broker.publish("orders");
    broker.publish("orders");
    wait_until(|| recorder.len() == 2).await;

    broker.kick_all();
    events_until(&mut events, |e| matches!(e, SessionEvent::Reconnected { .. })).await;
    wait_until(|| broker.is_subscribed("orders")).await;
    broker.publish("orders");
    wait_until(|| recorder.len() == 3).await;

    assert_eq!(recorder.seen(), payloads(0..3));
    assert_eq!(broker.sessions(), 2);

    let summary = consumer.shutdown().await;
    assert_eq!(summary.events, 3);
    assert_eq!(summary.gaps, 0);
    assert_eq!(summary.cursor, 3);
}
