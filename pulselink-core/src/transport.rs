//! Transport abstraction.
//!
//! A transport is a single physical connection carrying protocol messages.
//! The connection manager treats every kind as interchangeable behind the
//! [`Transport`]/[`TransportFactory`] pair: the factory establishes the
//! physical link and delivers all inbound traffic on the event sender it is
//! given, the handle sends outbound messages and closes the link. Factories
//! are handed to the client at construction; there is no ambient registry.

use async_trait::async_trait;
use pulselink_protocol::{codes, ErrorInfo, ProtocolMessage};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport kinds, ordered by capability in `ClientOptions::transports`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent socket transport.
    WebSocket,
    /// Request/response fallback transport.
    Comet,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => write!(f, "websocket"),
            TransportKind::Comet => write!(f, "comet"),
        }
    }
}

/// Parameters for one physical connection attempt.
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub host: String,
    pub kind: TransportKind,
    pub token: Option<String>,
}

/// Everything a live transport reports back to the connection manager.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded inbound protocol message.
    Protocol(ProtocolMessage),
    /// A mid-flight transport error. The transport is unusable afterwards.
    Error(ErrorInfo),
    /// The transport closed in an orderly fashion.
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("codec error: {0}")]
    Codec(#[from] anyhow::Error),
    #[error("transport closed")]
    Closed,
}

impl From<TransportError> for ErrorInfo {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectTimeout => {
                ErrorInfo::new(codes::CONNECTION_TIMED_OUT, 408, "connect timed out")
            }
            other => ErrorInfo::disconnected(other.to_string()),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn host(&self) -> &str;

    async fn send(&self, msg: ProtocolMessage) -> Result<(), TransportError>;

    /// Close the physical link. Events already queued may still be observed
    /// by a receiver that has not yet been dropped.
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Establish a physical connection to `params.host`.
    ///
    /// All inbound traffic and lifecycle events of the resulting transport
    /// must be delivered on `events`; once the returned handle is dropped
    /// together with the receiving half, the transport is quiesced and
    /// nothing it emits is acted upon.
    async fn connect(
        &self,
        params: TransportParams,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, ErrorInfo>;
}
