#![allow(dead_code)]

use async_trait::async_trait;
use pulselink_core::protocol::{
    Action, ConnectionDetails, ErrorInfo, Message, PresenceMessage, ProtocolMessage,
};
use pulselink_core::transport::{
    Transport, TransportError, TransportEvent, TransportFactory, TransportKind, TransportParams,
};
use pulselink_core::{ClientOptions, ConnectionState, Realtime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use tokio::sync::mpsc;
use tracing::Level;

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

/// One accepted mock connection: the test injects inbound traffic through
/// `events` and observes everything the client wrote through `sent`.
pub struct MockConn {
    pub params: TransportParams,
    pub events: mpsc::Sender<TransportEvent>,
    pub sent: mpsc::UnboundedReceiver<ProtocolMessage>,
}

pub struct MockFactory {
    kind: TransportKind,
    conns_tx: mpsc::UnboundedSender<MockConn>,
    /// While set, connect attempts fail at construction.
    pub refuse: Arc<AtomicBool>,
}

/// Build a factory for `kind`; accepted connections arrive on the returned
/// receiver in attempt order.
pub fn mock_factory(kind: TransportKind) -> (Arc<MockFactory>, mpsc::UnboundedReceiver<MockConn>) {
    let (conns_tx, conns_rx) = mpsc::unbounded_channel();
    (
        Arc::new(MockFactory {
            kind,
            conns_tx,
            refuse: Arc::new(AtomicBool::new(false)),
        }),
        conns_rx,
    )
}

struct MockTransport {
    kind: TransportKind,
    host: String,
    sent_tx: mpsc::UnboundedSender<ProtocolMessage>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn host(&self) -> &str {
        &self.host
    }

    async fn send(&self, msg: ProtocolMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.sent_tx.send(msg).map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(
        &self,
        params: TransportParams,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, ErrorInfo> {
        if self.refuse.load(Ordering::Acquire) {
            return Err(ErrorInfo::disconnected("connection refused"));
        }
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            kind: self.kind,
            host: params.host.clone(),
            sent_tx,
            closed: AtomicBool::new(false),
        });
        let _ = self.conns_tx.send(MockConn {
            params,
            events,
            sent: sent_rx,
        });
        Ok(transport)
    }
}

/// Erase mock factory types for `Realtime::new`.
pub fn factories(list: Vec<Arc<MockFactory>>) -> Vec<Arc<dyn TransportFactory>> {
    list.into_iter()
        .map(|f| f as Arc<dyn TransportFactory>)
        .collect()
}

/// Options with short, test-friendly timeouts.
pub fn test_options() -> ClientOptions {
    ClientOptions::new("realtime.example.com")
        .realtime_request_timeout(50)
        .disconnected_retry_timeout(1000)
        .suspended_retry_timeout(1000)
        .channel_retry_timeout(150)
        .connection_state_ttl(2900)
}

/// Connect the client and complete the handshake on the first mock
/// connection.
pub async fn establish(
    realtime: &Realtime,
    conns: &mut mpsc::UnboundedReceiver<MockConn>,
    max_idle_ms: u64,
) -> MockConn {
    realtime.connection().connect().await;
    let conn = conns.recv().await.expect("connect attempt");
    conn.events
        .send(TransportEvent::Protocol(connected_msg(max_idle_ms)))
        .await
        .expect("driver listening");
    assert!(
        realtime
            .connection()
            .wait_for_state(ConnectionState::Connected)
            .await
    );
    conn
}

/// Next event from a broadcast stream, bounded by a generous virtual-time
/// window so a missing event fails the test instead of hanging it.
pub async fn next_event<T: Clone>(rx: &mut tokio::sync::broadcast::Receiver<T>) -> T {
    tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
        .await
        .expect("event within virtual window")
        .expect("event stream open")
}

/// Next protocol message the client wrote to this transport.
pub async fn next_sent(conn: &mut MockConn) -> ProtocolMessage {
    tokio::time::timeout(std::time::Duration::from_secs(10), conn.sent.recv())
        .await
        .expect("outbound message within virtual window")
        .expect("transport open")
}

// ---- protocol message builders -----------------------------------------

pub fn connected_msg(max_idle_ms: u64) -> ProtocolMessage {
    ProtocolMessage {
        connection_id: Some("conn-1".into()),
        connection_details: Some(ConnectionDetails {
            connection_key: None,
            max_idle_interval_ms: Some(max_idle_ms),
            connection_state_ttl_ms: None,
        }),
        ..ProtocolMessage::new(Action::Connected)
    }
}

pub fn closed_msg() -> ProtocolMessage {
    ProtocolMessage::new(Action::Closed)
}

pub fn heartbeat_msg() -> ProtocolMessage {
    ProtocolMessage::new(Action::Heartbeat)
}

pub fn error_msg(code: u32, status: u16, message: &str) -> ProtocolMessage {
    ProtocolMessage {
        error: Some(ErrorInfo::new(code, status, message)),
        ..ProtocolMessage::new(Action::Error)
    }
}

pub fn channel_error_msg(channel: &str, code: u32, status: u16, message: &str) -> ProtocolMessage {
    ProtocolMessage {
        channel: Some(channel.into()),
        error: Some(ErrorInfo::new(code, status, message)),
        ..ProtocolMessage::new(Action::Error)
    }
}

pub fn attached_msg(channel: &str) -> ProtocolMessage {
    ProtocolMessage {
        channel: Some(channel.into()),
        ..ProtocolMessage::new(Action::Attached)
    }
}

pub fn detached_msg(channel: &str) -> ProtocolMessage {
    ProtocolMessage {
        channel: Some(channel.into()),
        ..ProtocolMessage::new(Action::Detached)
    }
}

pub fn ack_msg(serial: i64, count: u32) -> ProtocolMessage {
    ProtocolMessage {
        msg_serial: Some(serial),
        count: Some(count),
        ..ProtocolMessage::new(Action::Ack)
    }
}

pub fn nack_msg(serial: i64, count: u32, error: ErrorInfo) -> ProtocolMessage {
    ProtocolMessage {
        msg_serial: Some(serial),
        count: Some(count),
        error: Some(error),
        ..ProtocolMessage::new(Action::Nack)
    }
}

pub fn message_msg(channel: &str, messages: Vec<Message>) -> ProtocolMessage {
    ProtocolMessage {
        channel: Some(channel.into()),
        messages: Some(messages),
        ..ProtocolMessage::new(Action::Message)
    }
}

pub fn presence_msg(channel: &str, items: Vec<PresenceMessage>) -> ProtocolMessage {
    ProtocolMessage {
        channel: Some(channel.into()),
        presence: Some(items),
        ..ProtocolMessage::new(Action::Presence)
    }
}
