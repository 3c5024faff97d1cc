//! Connection driver.
//!
//! A single task owns the connection state machine, the transport slots,
//! the pending-message ledger and every channel entry. API handles talk to
//! it over a command channel with oneshot responders; transport events,
//! timer ticks and commands are all serialized through one select! loop, so
//! no two transitions ever interleave.
//!
//! Transport ownership is a two-slot structure: `current` is the one active
//! transport, `candidate` exists only during a make-before-break upgrade
//! attempt and its events never touch channels or the ledger until it is
//! promoted. Connect attempts run as spawned tasks and report back tagged
//! with an attempt id; outcomes of abandoned attempts are discarded, which
//! quiesces superseded transports.

use crate::channel::state::{ChannelEffect, ChannelState, ChannelStateChange, ChannelStateMachine};
use crate::config::ClientOptions;
use crate::connection::state::{
    ConnectionEffect, ConnectionState, ConnectionStateChange, ConnectionStateMachine,
};
use crate::ledger::PendingLedger;
use crate::presence::{PresenceMap, PresenceMember};
use crate::transport::{Transport, TransportEvent, TransportFactory, TransportParams};
use pulselink_protocol::{Action, ErrorInfo, Message, PresenceAction, PresenceMessage, ProtocolMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(5);

pub(crate) type OpWaiter = oneshot::Sender<Result<(), ErrorInfo>>;

/// Per-channel observer surfaces handed to API handles.
#[derive(Debug, Clone)]
pub(crate) struct ChannelSeed {
    pub state_rx: watch::Receiver<ChannelState>,
    pub events_tx: broadcast::Sender<ChannelStateChange>,
}

pub(crate) enum Command {
    Connect,
    Close,
    ErrorReason {
        reply: oneshot::Sender<Option<ErrorInfo>>,
    },
    EnsureChannel {
        name: String,
        reply: oneshot::Sender<ChannelSeed>,
    },
    Attach {
        name: String,
        reply: OpWaiter,
    },
    Detach {
        name: String,
        reply: OpWaiter,
    },
    Publish {
        name: String,
        messages: Vec<Message>,
        reply: OpWaiter,
    },
    Subscribe {
        name: String,
        sender: mpsc::Sender<Message>,
        reply: OpWaiter,
    },
    PresenceEnter {
        name: String,
        client_id: String,
        data: Option<serde_json::Value>,
        reply: OpWaiter,
    },
    PresenceLeave {
        name: String,
        client_id: String,
        reply: OpWaiter,
    },
    PresenceGet {
        name: String,
        reply: oneshot::Sender<Result<Vec<PresenceMember>, ErrorInfo>>,
    },
    PresenceSubscribe {
        name: String,
        sender: mpsc::Sender<PresenceMessage>,
        reply: OpWaiter,
    },
}

/// An operation held back until its channel's attach settles or the
/// connection comes back.
enum QueuedOp {
    Publish {
        messages: Vec<Message>,
        reply: OpWaiter,
    },
    Presence {
        items: Vec<PresenceMessage>,
        reply: OpWaiter,
    },
}

fn reject_op(op: QueuedOp, err: ErrorInfo) {
    match op {
        QueuedOp::Publish { reply, .. } | QueuedOp::Presence { reply, .. } => {
            let _ = reply.send(Err(err));
        }
    }
}

struct ChannelEntry {
    machine: ChannelStateMachine,
    state_tx: watch::Sender<ChannelState>,
    events_tx: broadcast::Sender<ChannelStateChange>,
    attach_waiters: Vec<OpWaiter>,
    detach_waiters: Vec<OpWaiter>,
    queued: Vec<QueuedOp>,
    subscribers: Vec<mpsc::Sender<Message>>,
    presence_subscribers: Vec<mpsc::Sender<PresenceMessage>>,
    presence: PresenceMap,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SlotRole {
    Current,
    Candidate,
}

struct TransportSlot {
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
}

struct PendingAttempt {
    id: u64,
    role: SlotRole,
}

enum Internal {
    ConnectOutcome {
        attempt: u64,
        role: SlotRole,
        result: Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), ErrorInfo>,
    },
}

/// Host selection: primary first, fallbacks in configured order after
/// placement-constraint failures, wrapping back to the primary.
struct HostCycler {
    primary: String,
    fallbacks: Vec<String>,
    index: usize,
}

impl HostCycler {
    fn new(primary: String, fallbacks: Vec<String>) -> Self {
        Self {
            primary,
            fallbacks,
            index: 0,
        }
    }

    fn current(&self) -> &str {
        if self.index == 0 {
            &self.primary
        } else {
            &self.fallbacks[self.index - 1]
        }
    }

    /// Move to the next fallback. Returns false once every host has been
    /// tried in this cycle; the cycler is then back at the primary.
    fn advance(&mut self) -> bool {
        if self.index < self.fallbacks.len() {
            self.index += 1;
            true
        } else {
            self.index = 0;
            false
        }
    }

    fn reset(&mut self) {
        self.index = 0;
    }
}

pub(crate) struct DriverHandles {
    pub cmd_tx: mpsc::Sender<Command>,
    pub state_rx: watch::Receiver<ConnectionState>,
    pub events_tx: broadcast::Sender<ConnectionStateChange>,
    pub cancel: CancellationToken,
}

/// Spawn the driver task and return the handles the facade needs.
pub(crate) fn spawn_driver(
    opts: ClientOptions,
    factories: Vec<Arc<dyn TransportFactory>>,
) -> DriverHandles {
    // order factories by the configured transport preference; kinds not
    // listed keep their given order at the tail
    let mut ordered: Vec<Arc<dyn TransportFactory>> = Vec::new();
    for kind in &opts.transports {
        if let Some(f) = factories.iter().find(|f| f.kind() == *kind) {
            ordered.push(Arc::clone(f));
        }
    }
    for f in &factories {
        if !ordered.iter().any(|o| o.kind() == f.kind()) {
            ordered.push(Arc::clone(f));
        }
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (conn_state_tx, state_rx) = watch::channel(ConnectionState::Initialized);
    let (conn_events_tx, _) = broadcast::channel(256);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let driver = ConnectionDriver {
        machine: ConnectionStateMachine::new(&opts),
        hosts: HostCycler::new(opts.primary_host.clone(), opts.fallback_hosts.clone()),
        opts,
        factories: ordered,
        kind_index: 0,
        attempt_seq: 0,
        pending_attempt: None,
        current: None,
        candidate: None,
        upgrade_attempted: false,
        ledger: PendingLedger::new(),
        queued_sends: Vec::new(),
        channels: HashMap::new(),
        conn_state_tx,
        conn_events_tx: conn_events_tx.clone(),
        cmd_rx,
        internal_tx,
        internal_rx,
        cancel: cancel.clone(),
    };
    tokio::spawn(driver.run());

    DriverHandles {
        cmd_tx,
        state_rx,
        events_tx: conn_events_tx,
        cancel,
    }
}

struct ConnectionDriver {
    opts: ClientOptions,
    factories: Vec<Arc<dyn TransportFactory>>,
    machine: ConnectionStateMachine,
    hosts: HostCycler,
    kind_index: usize,
    attempt_seq: u64,
    pending_attempt: Option<PendingAttempt>,
    current: Option<TransportSlot>,
    candidate: Option<TransportSlot>,
    upgrade_attempted: bool,
    ledger: PendingLedger,
    queued_sends: Vec<(String, QueuedOp)>,
    channels: HashMap<String, ChannelEntry>,
    conn_state_tx: watch::Sender<ConnectionState>,
    conn_events_tx: broadcast::Sender<ConnectionStateChange>,
    cmd_rx: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    cancel: CancellationToken,
}

async fn recv_slot(slot: &mut Option<TransportSlot>) -> Option<TransportEvent> {
    match slot {
        Some(s) => s.events.recv().await,
        None => std::future::pending().await,
    }
}

impl ConnectionDriver {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_command(cmd, Instant::now()).await,
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }
                maybe_internal = self.internal_rx.recv() => {
                    if let Some(internal) = maybe_internal {
                        self.handle_internal(internal, Instant::now()).await;
                    }
                }
                ev = recv_slot(&mut self.current) => {
                    self.handle_current_event(ev, Instant::now()).await;
                }
                ev = recv_slot(&mut self.candidate) => {
                    self.handle_candidate_event(ev, Instant::now()).await;
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }
    }

    // ---- commands -------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command, now: Instant) {
        match cmd {
            Command::Connect => {
                let effects = self.machine.connect_requested(now);
                self.apply_effects(effects, now).await;
            }
            Command::Close => {
                let effects = self.machine.close_requested(now, self.current.is_some());
                self.apply_effects(effects, now).await;
            }
            Command::ErrorReason { reply } => {
                let _ = reply.send(self.machine.error_reason().cloned());
            }
            Command::EnsureChannel { name, reply } => {
                let entry = self.ensure_entry(&name);
                let seed = ChannelSeed {
                    state_rx: entry.state_tx.subscribe(),
                    events_tx: entry.events_tx.clone(),
                };
                let _ = reply.send(seed);
            }
            Command::Attach { name, reply } => {
                let connected = self.connected();
                let effects = {
                    let entry = self.ensure_entry(&name);
                    entry.attach_waiters.push(reply);
                    entry.machine.attach_requested(now, connected)
                };
                self.apply_channel_effects(&name, effects).await;
            }
            Command::Detach { name, reply } => {
                let connected = self.connected();
                let effects = {
                    let entry = self.ensure_entry(&name);
                    entry.detach_waiters.push(reply);
                    entry.machine.detach_requested(now, connected)
                };
                self.apply_channel_effects(&name, effects).await;
            }
            Command::Publish {
                name,
                messages,
                reply,
            } => {
                let entry = self.ensure_entry(&name);
                match entry.machine.state() {
                    ChannelState::Failed => {
                        let _ = reply.send(Err(entry.machine.failure_error()));
                    }
                    ChannelState::Attaching => {
                        entry.queued.push(QueuedOp::Publish { messages, reply });
                    }
                    _ => {
                        self.dispatch_op(&name, QueuedOp::Publish { messages, reply })
                            .await;
                    }
                }
            }
            Command::Subscribe {
                name,
                sender,
                reply,
            } => {
                let connected = self.connected();
                let effects = {
                    let entry = self.ensure_entry(&name);
                    if entry.machine.state() == ChannelState::Failed {
                        let _ = reply.send(Err(entry.machine.failure_error()));
                        return;
                    }
                    entry.subscribers.push(sender);
                    if entry.machine.state() == ChannelState::Attached {
                        let _ = reply.send(Ok(()));
                        return;
                    }
                    entry.attach_waiters.push(reply);
                    entry.machine.attach_requested(now, connected)
                };
                self.apply_channel_effects(&name, effects).await;
            }
            Command::PresenceEnter {
                name,
                client_id,
                data,
                reply,
            } => {
                let items = vec![PresenceMessage {
                    action: PresenceAction::Enter,
                    client_id: Some(client_id),
                    data,
                }];
                self.presence_op(&name, items, reply, now).await;
            }
            Command::PresenceLeave {
                name,
                client_id,
                reply,
            } => {
                let items = vec![PresenceMessage {
                    action: PresenceAction::Leave,
                    client_id: Some(client_id),
                    data: None,
                }];
                self.presence_op(&name, items, reply, now).await;
            }
            Command::PresenceGet { name, reply } => {
                let entry = self.ensure_entry(&name);
                let result = if entry.machine.state() == ChannelState::Failed {
                    Err(entry.machine.failure_error())
                } else {
                    Ok(entry.presence.snapshot())
                };
                let _ = reply.send(result);
            }
            Command::PresenceSubscribe {
                name,
                sender,
                reply,
            } => {
                let connected = self.connected();
                let effects = {
                    let entry = self.ensure_entry(&name);
                    if entry.machine.state() == ChannelState::Failed {
                        let _ = reply.send(Err(entry.machine.failure_error()));
                        return;
                    }
                    entry.presence_subscribers.push(sender);
                    if entry.machine.state() == ChannelState::Attached {
                        let _ = reply.send(Ok(()));
                        return;
                    }
                    entry.attach_waiters.push(reply);
                    entry.machine.attach_requested(now, connected)
                };
                self.apply_channel_effects(&name, effects).await;
            }
        }
    }

    async fn presence_op(
        &mut self,
        name: &str,
        items: Vec<PresenceMessage>,
        reply: OpWaiter,
        now: Instant,
    ) {
        let connected = self.connected();
        let state = self.ensure_entry(name).machine.state();
        match state {
            ChannelState::Failed => {
                let err = self.channels[name].machine.failure_error();
                let _ = reply.send(Err(err));
            }
            ChannelState::Attached => {
                self.dispatch_op(name, QueuedOp::Presence { items, reply })
                    .await;
            }
            ChannelState::Attaching => {
                self.channels
                    .get_mut(name)
                    .expect("entry ensured")
                    .queued
                    .push(QueuedOp::Presence { items, reply });
            }
            _ => {
                // presence implies attachment
                let effects = {
                    let entry = self.channels.get_mut(name).expect("entry ensured");
                    entry.queued.push(QueuedOp::Presence { items, reply });
                    entry.machine.attach_requested(now, connected)
                };
                self.apply_channel_effects(name, effects).await;
            }
        }
    }

    // ---- transport attempts --------------------------------------------

    async fn handle_internal(&mut self, internal: Internal, now: Instant) {
        let Internal::ConnectOutcome {
            attempt,
            role,
            result,
        } = internal;
        let valid = self
            .pending_attempt
            .as_ref()
            .is_some_and(|p| p.id == attempt && p.role == role);
        if !valid {
            if let Ok((transport, _events)) = result {
                Self::spawn_close(transport);
            }
            tracing::debug!(attempt, "discarding outcome of abandoned connect attempt");
            return;
        }
        self.pending_attempt = None;
        match role {
            SlotRole::Current => match result {
                Ok((transport, events)) => {
                    if self.machine.state() != ConnectionState::Connecting {
                        Self::spawn_close(transport);
                        return;
                    }
                    tracing::debug!(
                        host = transport.host(),
                        kind = %transport.kind(),
                        "transport established; awaiting handshake"
                    );
                    self.current = Some(TransportSlot { transport, events });
                }
                Err(err) => {
                    if err.is_placement_constraint() && self.try_fallback_hop(now) {
                        return;
                    }
                    // prefer the next transport kind on the next attempt
                    self.kind_index += 1;
                    let effects = self.machine.connect_attempt_failed(now, err);
                    self.apply_effects(effects, now).await;
                }
            },
            SlotRole::Candidate => match result {
                Ok((transport, events)) => {
                    self.candidate = Some(TransportSlot { transport, events });
                }
                Err(err) => {
                    tracing::debug!(error = %err, "transport upgrade attempt failed");
                }
            },
        }
    }

    fn start_connect_attempt(&mut self) {
        self.upgrade_attempted = false;
        let Some(factory) = self
            .factories
            .get(self.kind_index % self.factories.len().max(1))
            .cloned()
        else {
            let attempt = self.next_attempt(SlotRole::Current);
            let _ = self.internal_tx.send(Internal::ConnectOutcome {
                attempt,
                role: SlotRole::Current,
                result: Err(ErrorInfo::disconnected("no transports configured")),
            });
            return;
        };
        let params = TransportParams {
            host: self.hosts.current().to_string(),
            kind: factory.kind(),
            token: self.opts.token.clone(),
        };
        self.spawn_connect(factory, params, SlotRole::Current);
    }

    fn spawn_connect(
        &mut self,
        factory: Arc<dyn TransportFactory>,
        params: TransportParams,
        role: SlotRole,
    ) {
        let attempt = self.next_attempt(role);
        let internal_tx = self.internal_tx.clone();
        tracing::debug!(host = %params.host, kind = %params.kind, attempt, "starting connect attempt");
        tokio::spawn(async move {
            let (events_tx, events_rx) = mpsc::channel(64);
            let result = factory
                .connect(params, events_tx)
                .await
                .map(|transport| (transport, events_rx));
            let _ = internal_tx.send(Internal::ConnectOutcome {
                attempt,
                role,
                result,
            });
        });
    }

    fn next_attempt(&mut self, role: SlotRole) -> u64 {
        self.attempt_seq += 1;
        self.pending_attempt = Some(PendingAttempt {
            id: self.attempt_seq,
            role,
        });
        self.attempt_seq
    }

    fn try_fallback_hop(&mut self, now: Instant) -> bool {
        if !self.hosts.advance() {
            return false;
        }
        tracing::info!(host = self.hosts.current(), "placement constraint: trying fallback host");
        if let Some(slot) = self.current.take() {
            Self::spawn_close(slot.transport);
        }
        self.pending_attempt = None;
        self.machine.restart_connect_window(now);
        self.start_connect_attempt();
        true
    }

    fn maybe_start_upgrade(&mut self) {
        if self.upgrade_attempted {
            return;
        }
        let Some(preferred) = self.factories.first().cloned() else {
            return;
        };
        let Some(slot) = &self.current else { return };
        if slot.transport.kind() == preferred.kind() {
            return;
        }
        self.upgrade_attempted = true;
        let params = TransportParams {
            host: slot.transport.host().to_string(),
            kind: preferred.kind(),
            token: self.opts.token.clone(),
        };
        tracing::info!(
            from = %slot.transport.kind(),
            to = %preferred.kind(),
            "attempting transport upgrade"
        );
        self.spawn_connect(preferred, params, SlotRole::Candidate);
    }

    // ---- transport events ----------------------------------------------

    async fn handle_current_event(&mut self, ev: Option<TransportEvent>, now: Instant) {
        match ev {
            Some(TransportEvent::Protocol(msg)) => {
                self.machine.message_received(now);
                self.route(msg, now).await;
            }
            Some(TransportEvent::Error(err)) => {
                self.connection_error_received(err, now).await;
            }
            Some(TransportEvent::Closed) | None => {
                self.current = None;
                let effects = match self.machine.state() {
                    ConnectionState::Closing => self.machine.closed_received(now),
                    ConnectionState::Connected => self.machine.transport_broken(
                        now,
                        ErrorInfo::disconnected("transport closed unexpectedly"),
                    ),
                    ConnectionState::Connecting => self.machine.connect_attempt_failed(
                        now,
                        ErrorInfo::disconnected("transport closed during connect"),
                    ),
                    _ => Vec::new(),
                };
                self.apply_effects(effects, now).await;
            }
        }
    }

    async fn handle_candidate_event(&mut self, ev: Option<TransportEvent>, now: Instant) {
        match ev {
            Some(TransportEvent::Protocol(msg)) if msg.action == Action::Connected => {
                let Some(candidate) = self.candidate.take() else {
                    return;
                };
                if self.machine.state() != ConnectionState::Connected {
                    Self::spawn_close(candidate.transport);
                    return;
                }
                tracing::info!(kind = %candidate.transport.kind(), "transport upgraded");
                if let Some(old) = self.current.replace(candidate) {
                    Self::spawn_close(old.transport);
                }
                let max_idle = msg
                    .connection_details
                    .as_ref()
                    .and_then(|d| d.max_idle_interval_ms)
                    .map(Duration::from_millis);
                self.machine.refresh_details(now, max_idle);
            }
            Some(TransportEvent::Protocol(msg)) => {
                tracing::debug!(action = %msg.action, "candidate transport message before CONNECTED dropped");
            }
            Some(TransportEvent::Error(err)) => {
                tracing::debug!(error = %err, "candidate transport failed");
                if let Some(c) = self.candidate.take() {
                    Self::spawn_close(c.transport);
                }
            }
            Some(TransportEvent::Closed) | None => {
                if let Some(c) = self.candidate.take() {
                    Self::spawn_close(c.transport);
                }
            }
        }
    }

    async fn connection_error_received(&mut self, err: ErrorInfo, now: Instant) {
        let effects = match self.machine.state() {
            ConnectionState::Connecting => {
                if err.is_placement_constraint() && self.try_fallback_hop(now) {
                    return;
                }
                if err.is_fatal_for_connection() {
                    self.machine.fatal_error(now, err)
                } else {
                    self.machine.connect_attempt_failed(now, err)
                }
            }
            ConnectionState::Connected => {
                if err.is_fatal_for_connection() {
                    self.machine.fatal_error(now, err)
                } else {
                    self.machine.transport_broken(now, err)
                }
            }
            ConnectionState::Closing => self.machine.closed_received(now),
            _ => Vec::new(),
        };
        self.apply_effects(effects, now).await;
    }

    // ---- demultiplexing -------------------------------------------------

    async fn route(&mut self, msg: ProtocolMessage, now: Instant) {
        if msg.is_channel_scoped() {
            let name = msg.channel.clone().expect("channel-scoped");
            if !self.channels.contains_key(&name) {
                tracing::debug!(channel = %name, action = %msg.action, "message for unknown channel dropped");
                return;
            }
            self.route_channel(&name, msg, now).await;
            return;
        }
        match msg.action {
            Action::Connected => {
                let max_idle = msg
                    .connection_details
                    .as_ref()
                    .and_then(|d| d.max_idle_interval_ms)
                    .map(Duration::from_millis);
                let ttl = msg
                    .connection_details
                    .as_ref()
                    .and_then(|d| d.connection_state_ttl_ms)
                    .map(Duration::from_millis);
                let effects = self.machine.handshake_completed(now, max_idle, ttl);
                self.apply_effects(effects, now).await;
                self.maybe_start_upgrade();
            }
            Action::Ack => {
                self.ledger
                    .ack(msg.msg_serial.unwrap_or(0), msg.count.unwrap_or(1));
            }
            Action::Nack => {
                let err = msg
                    .error
                    .unwrap_or_else(|| ErrorInfo::new(50000, 500, "message not acknowledged"));
                self.ledger
                    .nack(msg.msg_serial.unwrap_or(0), msg.count.unwrap_or(1), err);
            }
            Action::Error => {
                let err = msg
                    .error
                    .unwrap_or_else(|| ErrorInfo::new(50000, 500, "unknown server error"));
                self.connection_error_received(err, now).await;
            }
            Action::Disconnected => {
                let err = msg
                    .error
                    .unwrap_or_else(|| ErrorInfo::disconnected("server requested disconnect"));
                self.connection_error_received(err, now).await;
            }
            Action::Closed => {
                let effects = self.machine.closed_received(now);
                self.apply_effects(effects, now).await;
            }
            Action::Heartbeat => {
                // liveness was recorded on receipt; nothing else to do
            }
            other => {
                tracing::debug!(action = %other, "unhandled connection-scoped action");
            }
        }
    }

    async fn route_channel(&mut self, name: &str, msg: ProtocolMessage, now: Instant) {
        let connected = self.connected();
        let effects = {
            let entry = self.channels.get_mut(name).expect("entry checked");
            match msg.action {
                Action::Attached => entry.machine.attached_received(now),
                Action::Detached => entry.machine.detached_received(now, connected),
                Action::Error => {
                    let err = msg.error.unwrap_or_else(|| {
                        ErrorInfo::channel_failed("unknown channel error")
                    });
                    entry.machine.error_received(now, err)
                }
                Action::Message => {
                    Self::deliver_messages(entry, name, msg.messages.unwrap_or_default());
                    return;
                }
                Action::Presence => {
                    Self::deliver_presence(entry, name, msg.presence.unwrap_or_default());
                    return;
                }
                other => {
                    tracing::debug!(channel = name, action = %other, "unhandled channel action");
                    return;
                }
            }
        };
        self.apply_channel_effects(name, effects).await;
    }

    fn deliver_messages(entry: &mut ChannelEntry, name: &str, messages: Vec<Message>) {
        entry.subscribers.retain(|s| !s.is_closed());
        for message in messages {
            for sub in &entry.subscribers {
                if sub.try_send(message.clone()).is_err() {
                    tracing::warn!(channel = name, "subscriber lagging; message dropped");
                }
            }
        }
    }

    fn deliver_presence(entry: &mut ChannelEntry, name: &str, items: Vec<PresenceMessage>) {
        entry.presence_subscribers.retain(|s| !s.is_closed());
        for item in items {
            entry.presence.apply(&item);
            for sub in &entry.presence_subscribers {
                if sub.try_send(item.clone()).is_err() {
                    tracing::warn!(channel = name, "presence subscriber lagging; event dropped");
                }
            }
        }
    }

    // ---- effects --------------------------------------------------------

    async fn apply_effects(&mut self, effects: Vec<ConnectionEffect>, now: Instant) {
        for effect in effects {
            match effect {
                ConnectionEffect::StartConnectAttempt => {
                    self.hosts.reset();
                    self.start_connect_attempt();
                }
                ConnectionEffect::DropTransport => self.drop_transports(),
                ConnectionEffect::SendClose => {
                    self.send_on_current(ProtocolMessage::close()).await;
                }
                ConnectionEffect::FailPending(err) => self.fail_pending(&err),
                ConnectionEffect::NotifyConnected => self.on_connection_ready(now).await,
                ConnectionEffect::PropagateFailure(err) => {
                    self.for_each_channel(now, |machine, now| machine.connection_failed(now, err.clone()))
                        .await;
                }
                ConnectionEffect::SuspendChannels(err) => {
                    self.for_each_channel(now, |machine, now| {
                        machine.connection_suspended(now, err.clone())
                    })
                    .await;
                }
                ConnectionEffect::DetachChannels => {
                    self.for_each_channel(now, |machine, now| machine.connection_closed(now))
                        .await;
                }
                ConnectionEffect::Emit(change) => self.emit_connection_change(change),
            }
        }
    }

    async fn for_each_channel<F>(&mut self, now: Instant, mut event: F)
    where
        F: FnMut(&mut ChannelStateMachine, Instant) -> Vec<ChannelEffect>,
    {
        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            let effects = match self.channels.get_mut(&name) {
                Some(entry) => event(&mut entry.machine, now),
                None => continue,
            };
            if !effects.is_empty() {
                self.apply_channel_effects(&name, effects).await;
            }
        }
    }

    async fn on_connection_ready(&mut self, now: Instant) {
        self.kind_index = 0;
        self.for_each_channel(now, |machine, now| machine.connection_connected(now))
            .await;
        let queued = std::mem::take(&mut self.queued_sends);
        for (name, op) in queued {
            self.dispatch_op(&name, op).await;
        }
    }

    async fn apply_channel_effects(&mut self, name: &str, effects: Vec<ChannelEffect>) {
        for effect in effects {
            match effect {
                ChannelEffect::SendAttach => {
                    self.send_on_current(ProtocolMessage::attach(name)).await;
                }
                ChannelEffect::SendDetach => {
                    self.send_on_current(ProtocolMessage::detach(name)).await;
                }
                ChannelEffect::SettleAttaches(outcome) => {
                    if let Some(entry) = self.channels.get_mut(name) {
                        for waiter in entry.attach_waiters.drain(..) {
                            let _ = waiter.send(outcome.clone());
                        }
                    }
                }
                ChannelEffect::SettleDetaches(outcome) => {
                    if let Some(entry) = self.channels.get_mut(name) {
                        for waiter in entry.detach_waiters.drain(..) {
                            let _ = waiter.send(outcome.clone());
                        }
                    }
                }
                ChannelEffect::FlushQueued => {
                    let ops = self
                        .channels
                        .get_mut(name)
                        .map(|e| std::mem::take(&mut e.queued))
                        .unwrap_or_default();
                    for op in ops {
                        self.dispatch_op(name, op).await;
                    }
                }
                ChannelEffect::RejectQueued(err) => {
                    if let Some(entry) = self.channels.get_mut(name) {
                        for op in entry.queued.drain(..) {
                            reject_op(op, err.clone());
                        }
                    }
                    // ops for this channel held at the connection level
                    // reject with it too
                    let mut kept = Vec::new();
                    for (n, op) in std::mem::take(&mut self.queued_sends) {
                        if n == name {
                            reject_op(op, err.clone());
                        } else {
                            kept.push((n, op));
                        }
                    }
                    self.queued_sends = kept;
                }
                ChannelEffect::ClearPresence => {
                    if let Some(entry) = self.channels.get_mut(name) {
                        entry.presence.clear();
                    }
                }
                ChannelEffect::Emit(change) => {
                    if let Some(entry) = self.channels.get_mut(name) {
                        tracing::debug!(
                            channel = name,
                            from = %change.previous,
                            to = %change.current,
                            "channel state change"
                        );
                        entry.state_tx.send_replace(change.current);
                        let _ = entry.events_tx.send(change);
                    }
                }
            }
        }
    }

    // ---- sending --------------------------------------------------------

    /// Transmit now if connected, hold back if the outage is considered
    /// transient and queueing is enabled, reject otherwise.
    async fn dispatch_op(&mut self, name: &str, op: QueuedOp) {
        let state = self.machine.state();
        if state == ConnectionState::Connected {
            match op {
                QueuedOp::Publish { messages, reply } => {
                    let serial = self.ledger.push(messages.len() as u32, reply);
                    let msg = ProtocolMessage::publish(name, serial, messages);
                    self.send_on_current(msg).await;
                }
                QueuedOp::Presence { items, reply } => {
                    let serial = self.ledger.push(items.len() as u32, reply);
                    let msg = ProtocolMessage::presence(name, serial, items);
                    self.send_on_current(msg).await;
                }
            }
        } else if state.can_queue() && self.opts.queue_messages {
            self.queued_sends.push((name.to_string(), op));
        } else {
            reject_op(op, self.not_connected_error());
        }
    }

    async fn send_on_current(&mut self, msg: ProtocolMessage) {
        if let Some(slot) = &self.current {
            if let Err(e) = slot.transport.send(msg).await {
                tracing::warn!(error = %e, "send on active transport failed");
            }
        } else {
            tracing::debug!(action = %msg.action, "no active transport; outbound message dropped");
        }
    }

    fn not_connected_error(&self) -> ErrorInfo {
        match self.machine.state() {
            ConnectionState::Suspended => self
                .machine
                .error_reason()
                .cloned()
                .unwrap_or_else(|| ErrorInfo::suspended("connection suspended")),
            ConnectionState::Closing | ConnectionState::Closed => {
                ErrorInfo::closed("connection closed")
            }
            ConnectionState::Failed => self
                .machine
                .error_reason()
                .cloned()
                .unwrap_or_else(|| ErrorInfo::disconnected("connection failed")),
            _ => ErrorInfo::disconnected("unable to send: not connected"),
        }
    }

    fn fail_pending(&mut self, err: &ErrorInfo) {
        let in_flight = self.ledger.fail_all(err);
        let queued = std::mem::take(&mut self.queued_sends);
        let held = queued.len();
        for (_, op) in queued {
            reject_op(op, err.clone());
        }
        if in_flight + held > 0 {
            tracing::debug!(in_flight, queued = held, error = %err, "rejected pending deliveries");
        }
    }

    // ---- plumbing -------------------------------------------------------

    fn connected(&self) -> bool {
        self.machine.state() == ConnectionState::Connected
    }

    fn ensure_entry(&mut self, name: &str) -> &mut ChannelEntry {
        if !self.channels.contains_key(name) {
            let (state_tx, _) = watch::channel(ChannelState::Initialized);
            let (events_tx, _) = broadcast::channel(64);
            tracing::debug!(channel = name, "channel created");
            self.channels.insert(
                name.to_string(),
                ChannelEntry {
                    machine: ChannelStateMachine::new(
                        name,
                        self.opts.channel_retry(),
                        self.opts.request_timeout(),
                    ),
                    state_tx,
                    events_tx,
                    attach_waiters: Vec::new(),
                    detach_waiters: Vec::new(),
                    queued: Vec::new(),
                    subscribers: Vec::new(),
                    presence_subscribers: Vec::new(),
                    presence: PresenceMap::default(),
                },
            );
        }
        self.channels.get_mut(name).expect("inserted above")
    }

    fn emit_connection_change(&mut self, change: ConnectionStateChange) {
        tracing::info!(from = %change.previous, to = %change.current, "connection state change");
        self.conn_state_tx.send_replace(change.current);
        let _ = self.conn_events_tx.send(change);
    }

    fn drop_transports(&mut self) {
        self.pending_attempt = None;
        if let Some(slot) = self.current.take() {
            Self::spawn_close(slot.transport);
        }
        if let Some(slot) = self.candidate.take() {
            Self::spawn_close(slot.transport);
        }
    }

    fn spawn_close(transport: Arc<dyn Transport>) {
        tokio::spawn(async move { transport.close().await });
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let effects = self.machine.poll_timers(now);
        if !effects.is_empty() {
            self.apply_effects(effects, now).await;
        }
        let connected = self.connected();
        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            let effects = self
                .channels
                .get_mut(&name)
                .map(|e| e.machine.poll_timers(now, connected))
                .unwrap_or_default();
            if !effects.is_empty() {
                self.apply_channel_effects(&name, effects).await;
            }
        }
    }

    async fn shutdown(&mut self) {
        let now = Instant::now();
        if !self.machine.state().is_terminal() {
            let effects = self.machine.close_requested(now, false);
            self.apply_effects(effects, now).await;
        }
        self.drop_transports();
        // no deferred result may outlive the driver unsettled
        let err = ErrorInfo::closed("client released");
        self.fail_pending(&err);
        for entry in self.channels.values_mut() {
            for waiter in entry.attach_waiters.drain(..) {
                let _ = waiter.send(Err(err.clone()));
            }
            for waiter in entry.detach_waiters.drain(..) {
                let _ = waiter.send(Err(err.clone()));
            }
            for op in entry.queued.drain(..) {
                reject_op(op, err.clone());
            }
        }
        tracing::debug!("connection driver stopped");
    }
}
