//! Connection state machine.
//!
//! Pure transition logic: every event method takes an explicit `now` and
//! returns the side effects the driver must perform, so transitions can be
//! unit-tested without timers or I/O. Timer deadlines are plain fields
//! (`None` = disarmed) surfaced through [`ConnectionStateMachine::poll_timers`];
//! arming a deadline overwrites the previous one, which keeps at most one
//! retry timer outstanding per scope.

use crate::backoff::retry_delay;
use crate::config::ClientOptions;
use pulselink_protocol::ErrorInfo;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// States in which outbound messages may wait for the transport to come
    /// back rather than failing immediately.
    #[inline]
    pub fn can_queue(&self) -> bool {
        matches!(
            self,
            ConnectionState::Initialized
                | ConnectionState::Connecting
                | ConnectionState::Disconnected
        )
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Tagged state-change event delivered to connection observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: Option<ErrorInfo>,
    /// Delay until the next automatic attempt, when one is scheduled.
    pub retry_in: Option<Duration>,
}

/// Side effects the driver performs after a transition.
#[derive(Debug)]
pub enum ConnectionEffect {
    /// Select host and transport kind and begin a connect attempt.
    StartConnectAttempt,
    /// Tear down the active transport (and any upgrade candidate).
    DropTransport,
    /// Write a CLOSE envelope to the active transport.
    SendClose,
    /// Reject every unresolved ledger entry and queued send.
    FailPending(ErrorInfo),
    /// The connection is up: flush queues, re-send pending channel attaches.
    NotifyConnected,
    /// Terminal failure: propagate to every channel.
    PropagateFailure(ErrorInfo),
    /// Outage escalated: attaching/attached channels move to suspended.
    SuspendChannels(ErrorInfo),
    /// Orderly shutdown: channels move to detached.
    DetachChannels,
    Emit(ConnectionStateChange),
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    error_reason: Option<ErrorInfo>,
    retry_attempts: u32,

    disconnected_retry: Duration,
    suspended_retry: Duration,
    request_timeout: Duration,
    state_ttl: Duration,

    /// Server-advertised maximum quiet interval, recorded on CONNECTED.
    max_idle_interval: Option<Duration>,

    connect_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    /// Anchored at the start of an outage; while it stands elapsed, failed
    /// attempts land in `suspended` instead of `disconnected`.
    ttl_deadline: Option<Instant>,
}

impl ConnectionStateMachine {
    pub fn new(opts: &ClientOptions) -> Self {
        Self {
            state: ConnectionState::Initialized,
            error_reason: None,
            retry_attempts: 0,
            disconnected_retry: opts.disconnected_retry(),
            suspended_retry: opts.suspended_retry(),
            request_timeout: opts.request_timeout(),
            state_ttl: opts.state_ttl(),
            max_idle_interval: None,
            connect_deadline: None,
            close_deadline: None,
            idle_deadline: None,
            retry_at: None,
            ttl_deadline: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn max_idle_interval(&self) -> Option<Duration> {
        self.max_idle_interval
    }

    /// Explicit connect request from the caller.
    pub fn connect_requested(&mut self, now: Instant) -> Vec<ConnectionEffect> {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Closing => Vec::new(),
            previous => {
                if previous.is_terminal() || previous == ConnectionState::Initialized {
                    // fresh start after an explicit close/failure
                    self.retry_attempts = 0;
                    self.ttl_deadline = None;
                    self.error_reason = None;
                }
                self.retry_at = None;
                self.connect_deadline = Some(now + self.request_timeout);
                let change = self.transition(ConnectionState::Connecting, None, None);
                vec![
                    ConnectionEffect::StartConnectAttempt,
                    ConnectionEffect::Emit(change),
                ]
            }
        }
    }

    /// Re-arm the connect window for a fallback-host hop that stays inside
    /// `connecting`.
    pub fn restart_connect_window(&mut self, now: Instant) {
        if self.state == ConnectionState::Connecting {
            self.connect_deadline = Some(now + self.request_timeout);
        }
    }

    /// CONNECTED handshake completed on the active transport.
    pub fn handshake_completed(
        &mut self,
        now: Instant,
        max_idle: Option<Duration>,
        ttl_override: Option<Duration>,
    ) -> Vec<ConnectionEffect> {
        if self.state != ConnectionState::Connecting {
            // duplicate CONNECTED on an established connection refreshes
            // the advertised parameters only
            self.refresh_details(now, max_idle);
            return Vec::new();
        }
        self.retry_attempts = 0;
        self.error_reason = None;
        self.connect_deadline = None;
        self.retry_at = None;
        self.ttl_deadline = None;
        if let Some(ttl) = ttl_override {
            self.state_ttl = ttl;
        }
        self.refresh_details(now, max_idle);
        let change = self.transition(ConnectionState::Connected, None, None);
        vec![
            ConnectionEffect::Emit(change),
            ConnectionEffect::NotifyConnected,
        ]
    }

    /// Update server-advertised parameters without a state change (used on
    /// duplicate CONNECTED and on transport promotion).
    pub fn refresh_details(&mut self, now: Instant, max_idle: Option<Duration>) {
        if let Some(idle) = max_idle {
            self.max_idle_interval = Some(idle);
        }
        if self.state == ConnectionState::Connected || self.state == ConnectionState::Connecting {
            self.arm_idle_deadline(now);
        }
    }

    /// A connect attempt did not produce an established connection.
    pub fn connect_attempt_failed(&mut self, now: Instant, err: ErrorInfo) -> Vec<ConnectionEffect> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.retry_attempts += 1;
        self.connect_deadline = None;
        if self.ttl_deadline.is_none() {
            self.ttl_deadline = Some(now + self.state_ttl);
        }
        let mut effects = vec![ConnectionEffect::DropTransport];
        if self.ttl_elapsed(now) {
            effects.extend(self.enter_suspended(now, &err));
        } else {
            let delay = retry_delay(self.retry_attempts.max(1), self.disconnected_retry);
            self.retry_at = Some(now + delay);
            self.error_reason = Some(err.clone());
            let change =
                self.transition(ConnectionState::Disconnected, Some(err), Some(delay));
            effects.push(ConnectionEffect::Emit(change));
        }
        effects
    }

    /// The established transport broke (socket drop, server DISCONNECTED,
    /// idle timeout).
    pub fn transport_broken(&mut self, now: Instant, err: ErrorInfo) -> Vec<ConnectionEffect> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }
        self.idle_deadline = None;
        if self.ttl_deadline.is_none() {
            self.ttl_deadline = Some(now + self.state_ttl);
        }
        let delay = retry_delay(self.retry_attempts.max(1), self.disconnected_retry);
        self.retry_at = Some(now + delay);
        self.error_reason = Some(err.clone());
        let change = self.transition(ConnectionState::Disconnected, Some(err), Some(delay));
        vec![ConnectionEffect::DropTransport, ConnectionEffect::Emit(change)]
    }

    /// Unrecoverable server error. The connection is dead until the caller
    /// reconnects explicitly.
    pub fn fatal_error(&mut self, _now: Instant, err: ErrorInfo) -> Vec<ConnectionEffect> {
        match self.state {
            ConnectionState::Closed | ConnectionState::Failed => Vec::new(),
            ConnectionState::Closing => self.complete_close(),
            _ => {
                self.cancel_timers();
                self.error_reason = Some(err.clone());
                let change = self.transition(ConnectionState::Failed, Some(err.clone()), None);
                vec![
                    ConnectionEffect::DropTransport,
                    ConnectionEffect::FailPending(err.clone()),
                    ConnectionEffect::PropagateFailure(err),
                    ConnectionEffect::Emit(change),
                ]
            }
        }
    }

    /// Explicit close request from the caller.
    pub fn close_requested(&mut self, now: Instant, transport_active: bool) -> Vec<ConnectionEffect> {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                Vec::new()
            }
            _ => {
                self.cancel_timers();
                let change = self.transition(ConnectionState::Closing, None, None);
                let mut effects = vec![ConnectionEffect::Emit(change)];
                if transport_active {
                    self.close_deadline = Some(now + self.request_timeout);
                    effects.push(ConnectionEffect::SendClose);
                } else {
                    effects.extend(self.complete_close());
                }
                effects
            }
        }
    }

    /// CLOSED acknowledged by the server, the transport ended while closing,
    /// or the close window timed out.
    pub fn closed_received(&mut self, _now: Instant) -> Vec<ConnectionEffect> {
        if self.state != ConnectionState::Closing {
            return Vec::new();
        }
        self.complete_close()
    }

    /// Any inbound protocol message counts as liveness.
    pub fn message_received(&mut self, now: Instant) {
        if self.state == ConnectionState::Connected {
            self.arm_idle_deadline(now);
        }
    }

    /// Surface elapsed deadlines. Called from the driver tick.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<ConnectionEffect> {
        match self.state {
            ConnectionState::Connecting => {
                if elapsed(self.connect_deadline, now) {
                    self.connect_deadline = None;
                    return self.connect_attempt_failed(
                        now,
                        ErrorInfo::timed_out("connection attempt timed out"),
                    );
                }
            }
            ConnectionState::Connected => {
                if elapsed(self.idle_deadline, now) {
                    self.idle_deadline = None;
                    return self.transport_broken(
                        now,
                        ErrorInfo::timed_out("idle timeout expired: no activity on connection"),
                    );
                }
            }
            ConnectionState::Disconnected => {
                if self.ttl_elapsed(now) {
                    let reason = self
                        .error_reason
                        .clone()
                        .unwrap_or_else(|| ErrorInfo::disconnected("connection unavailable"));
                    let mut effects = self.enter_suspended(now, &reason);
                    effects.insert(0, ConnectionEffect::DropTransport);
                    return effects;
                }
                if elapsed(self.retry_at, now) {
                    return self.retry_fired(now);
                }
            }
            ConnectionState::Suspended => {
                if elapsed(self.retry_at, now) {
                    return self.retry_fired(now);
                }
            }
            ConnectionState::Closing => {
                if elapsed(self.close_deadline, now) {
                    self.close_deadline = None;
                    return self.complete_close();
                }
            }
            _ => {}
        }
        Vec::new()
    }

    fn retry_fired(&mut self, now: Instant) -> Vec<ConnectionEffect> {
        self.retry_at = None;
        self.connect_deadline = Some(now + self.request_timeout);
        let change = self.transition(ConnectionState::Connecting, None, None);
        vec![
            ConnectionEffect::StartConnectAttempt,
            ConnectionEffect::Emit(change),
        ]
    }

    fn enter_suspended(&mut self, now: Instant, cause: &ErrorInfo) -> Vec<ConnectionEffect> {
        let err = ErrorInfo::suspended(format!("connection suspended: {}", cause.message));
        self.retry_at = Some(now + self.suspended_retry);
        self.error_reason = Some(err.clone());
        let change = self.transition(
            ConnectionState::Suspended,
            Some(err.clone()),
            Some(self.suspended_retry),
        );
        vec![
            ConnectionEffect::FailPending(err.clone()),
            ConnectionEffect::SuspendChannels(err),
            ConnectionEffect::Emit(change),
        ]
    }

    fn complete_close(&mut self) -> Vec<ConnectionEffect> {
        self.cancel_timers();
        let err = ErrorInfo::closed("connection closed by client");
        let change = self.transition(ConnectionState::Closed, None, None);
        vec![
            ConnectionEffect::DropTransport,
            ConnectionEffect::FailPending(err),
            ConnectionEffect::DetachChannels,
            ConnectionEffect::Emit(change),
        ]
    }

    fn transition(
        &mut self,
        to: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) -> ConnectionStateChange {
        let change = ConnectionStateChange {
            previous: self.state,
            current: to,
            reason,
            retry_in,
        };
        self.state = to;
        change
    }

    fn arm_idle_deadline(&mut self, now: Instant) {
        if let Some(idle) = self.max_idle_interval {
            self.idle_deadline = Some(now + idle + self.request_timeout);
        }
    }

    fn cancel_timers(&mut self) {
        self.connect_deadline = None;
        self.close_deadline = None;
        self.idle_deadline = None;
        self.retry_at = None;
        self.ttl_deadline = None;
    }

    fn ttl_elapsed(&self, now: Instant) -> bool {
        elapsed(self.ttl_deadline, now)
    }
}

fn elapsed(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|d| now >= d)
}
