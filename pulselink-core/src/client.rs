//! Public API surface.
//!
//! [`Realtime`] spawns the connection driver; [`Connection`], [`Channel`]
//! and [`Presence`] are cheap cloneable handles that talk to it over the
//! command channel. Every operation settles with either a success or a
//! structured [`ErrorInfo`]; nothing is left pending when the client goes
//! away.

use crate::channel::state::{ChannelState, ChannelStateChange};
use crate::config::ClientOptions;
use crate::connection::manager::{spawn_driver, ChannelSeed, Command, DriverHandles, OpWaiter};
use crate::connection::state::{ConnectionState, ConnectionStateChange};
use crate::presence::PresenceMember;
use crate::transport::TransportFactory;
use dashmap::DashMap;
use pulselink_protocol::{ErrorInfo, Message, PresenceMessage};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

fn client_gone() -> ErrorInfo {
    ErrorInfo::closed("client released")
}

/// The realtime client. Owns the connection driver task; dropping the last
/// handle cancels it, which tears the transport down and settles every
/// outstanding deferred result.
pub struct Realtime {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionStateChange>,
    /// Lazily-created channel handles, retained for the life of the client.
    channels: Arc<DashMap<String, ChannelSeed>>,
    cancel: CancellationToken,
}

impl Realtime {
    /// Create a client over the given transport factories. Factories are
    /// matched to `options.transports` to establish the preference order.
    pub fn new(options: ClientOptions, factories: Vec<Arc<dyn TransportFactory>>) -> Self {
        let DriverHandles {
            cmd_tx,
            state_rx,
            events_tx,
            cancel,
        } = spawn_driver(options, factories);
        Self {
            cmd_tx,
            state_rx,
            events_tx,
            channels: Arc::new(DashMap::new()),
            cancel,
        }
    }

    pub fn connection(&self) -> Connection {
        Connection {
            cmd_tx: self.cmd_tx.clone(),
            state_rx: self.state_rx.clone(),
            events_tx: self.events_tx.clone(),
        }
    }

    /// Get or lazily create the named channel.
    pub async fn channel(&self, name: &str) -> Result<Channel, ErrorInfo> {
        if let Some(seed) = self.channels.get(name) {
            return Ok(self.make_channel(name, seed.clone()));
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::EnsureChannel {
                name: name.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| client_gone())?;
        let seed = rx.await.map_err(|_| client_gone())?;
        self.channels.insert(name.to_string(), seed.clone());
        Ok(self.make_channel(name, seed))
    }

    /// Close the connection and wait for `closed`.
    pub async fn close(&self) {
        self.connection().close().await;
    }

    fn make_channel(&self, name: &str, seed: ChannelSeed) -> Channel {
        Channel {
            name: name.to_string(),
            cmd_tx: self.cmd_tx.clone(),
            state_rx: seed.state_rx,
            events_tx: seed.events_tx,
        }
    }
}

impl Drop for Realtime {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle on the logical connection.
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionStateChange>,
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Observe connection state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.events_tx.subscribe()
    }

    /// Request a connection attempt. Also the explicit reconnect required
    /// after a terminal failure.
    pub async fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect).await;
    }

    /// Close the connection and wait for it to reach a terminal state.
    pub async fn close(&self) {
        if self.cmd_tx.send(Command::Close).await.is_err() {
            return;
        }
        let mut rx = self.state_rx.clone();
        let _ = rx
            .wait_for(|s| matches!(s, ConnectionState::Closed | ConnectionState::Failed))
            .await;
    }

    /// The last terminal or transient error, if any.
    pub async fn error_reason(&self) -> Option<ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ErrorReason { reply: tx })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Wait until the connection reaches `expected`. Returns false if the
    /// client goes away first.
    pub async fn wait_for_state(&self, expected: ConnectionState) -> bool {
        let mut rx = self.state_rx.clone();
        let ok = rx.wait_for(|s| *s == expected).await.is_ok();
        ok
    }
}

/// Handle on one named channel.
#[derive(Clone)]
pub struct Channel {
    name: String,
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ChannelState>,
    events_tx: broadcast::Sender<ChannelStateChange>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.events_tx.subscribe()
    }

    pub async fn wait_for_state(&self, expected: ChannelState) -> bool {
        let mut rx = self.state_rx.clone();
        let ok = rx.wait_for(|s| *s == expected).await.is_ok();
        ok
    }

    /// Attach to the channel. Resolves once ATTACHED is confirmed, rejects
    /// on timeout or failure.
    pub async fn attach(&self) -> Result<(), ErrorInfo> {
        let name = self.name.clone();
        self.op(|reply| Command::Attach { name, reply }).await
    }

    /// Detach from the channel. A resolved no-op if never attached.
    pub async fn detach(&self) -> Result<(), ErrorInfo> {
        let name = self.name.clone();
        self.op(|reply| Command::Detach { name, reply }).await
    }

    /// Publish a single named message. Resolves on ACK, rejects on NACK or
    /// when the connection reaches a state that cannot deliver it.
    pub async fn publish(
        &self,
        event: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), ErrorInfo> {
        self.publish_batch(vec![Message::new(event, data)]).await
    }

    /// Publish a batch of messages under one acknowledgment.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> Result<(), ErrorInfo> {
        let name = self.name.clone();
        self.op(|reply| Command::Publish {
            name,
            messages,
            reply,
        })
        .await
    }

    /// Subscribe to messages on this channel, attaching if necessary.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<Message>, ErrorInfo> {
        let (sender, receiver) = mpsc::channel(256);
        let name = self.name.clone();
        self.op(|reply| Command::Subscribe {
            name,
            sender,
            reply,
        })
        .await?;
        Ok(receiver)
    }

    pub fn presence(&self) -> Presence {
        Presence {
            name: self.name.clone(),
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    async fn op(&self, make: impl FnOnce(OpWaiter) -> Command) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())?
    }
}

/// Presence operations on one channel.
#[derive(Clone)]
pub struct Presence {
    name: String,
    cmd_tx: mpsc::Sender<Command>,
}

impl Presence {
    /// Enter the presence set, attaching the channel if necessary.
    pub async fn enter(
        &self,
        client_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PresenceEnter {
                name: self.name.clone(),
                client_id: client_id.into(),
                data,
                reply: tx,
            })
            .await
            .map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())?
    }

    pub async fn leave(&self, client_id: impl Into<String>) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PresenceLeave {
                name: self.name.clone(),
                client_id: client_id.into(),
                reply: tx,
            })
            .await
            .map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())?
    }

    /// Snapshot of the currently known presence members.
    pub async fn get(&self) -> Result<Vec<PresenceMember>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PresenceGet {
                name: self.name.clone(),
                reply: tx,
            })
            .await
            .map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())?
    }

    /// Subscribe to presence events, attaching the channel if necessary.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<PresenceMessage>, ErrorInfo> {
        let (sender, receiver) = mpsc::channel(64);
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PresenceSubscribe {
                name: self.name.clone(),
                sender,
                reply: tx,
            })
            .await
            .map_err(|_| client_gone())?;
        rx.await.map_err(|_| client_gone())??;
        Ok(receiver)
    }
}
