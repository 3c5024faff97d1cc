//! Per-channel attach/detach state machine.
//!
//! Same shape as the connection machine: pure transitions taking an explicit
//! `now`, deadlines as plain fields, effects returned for the driver to
//! perform. Waiter queues (pending attach/detach deferreds, queued
//! operations) live in the driver's channel entry; the machine only decides
//! when they settle.

use crate::backoff::retry_delay;
use pulselink_protocol::ErrorInfo;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl Display for ChannelState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub reason: Option<ErrorInfo>,
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
pub enum ChannelEffect {
    /// Write an ATTACH envelope for this channel.
    SendAttach,
    /// Write a DETACH envelope for this channel.
    SendDetach,
    /// Settle every pending attach deferred with this outcome.
    SettleAttaches(Result<(), ErrorInfo>),
    /// Settle every pending detach deferred with this outcome.
    SettleDetaches(Result<(), ErrorInfo>),
    /// Operations queued while attaching may proceed.
    FlushQueued,
    /// Operations queued while attaching reject.
    RejectQueued(ErrorInfo),
    /// The presence member map is no longer meaningful.
    ClearPresence,
    Emit(ChannelStateChange),
}

#[derive(Debug)]
pub struct ChannelStateMachine {
    name: String,
    state: ChannelState,
    error_reason: Option<ErrorInfo>,
    retry_attempts: u32,

    retry_timeout: Duration,
    request_timeout: Duration,

    attach_deadline: Option<Instant>,
    detach_deadline: Option<Instant>,
    retry_at: Option<Instant>,
}

impl ChannelStateMachine {
    pub fn new(name: impl Into<String>, retry_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            state: ChannelState::Initialized,
            error_reason: None,
            retry_attempts: 0,
            retry_timeout,
            request_timeout,
            attach_deadline: None,
            detach_deadline: None,
            retry_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    /// Error used to reject operations on a failed channel.
    pub fn failure_error(&self) -> ErrorInfo {
        self.error_reason
            .clone()
            .unwrap_or_else(|| ErrorInfo::channel_failed(format!("channel {} is failed", self.name)))
    }

    /// Explicit attach request. Valid from every state except `attached`,
    /// where it resolves immediately.
    pub fn attach_requested(&mut self, now: Instant, connected: bool) -> Vec<ChannelEffect> {
        match self.state {
            ChannelState::Attached => vec![ChannelEffect::SettleAttaches(Ok(()))],
            ChannelState::Attaching => Vec::new(),
            _ => {
                self.error_reason = None;
                self.start_attach(now, connected)
            }
        }
    }

    /// Explicit detach request. A no-op on channels that were never
    /// attached; rejects on failed channels.
    pub fn detach_requested(&mut self, now: Instant, connected: bool) -> Vec<ChannelEffect> {
        match self.state {
            ChannelState::Detached | ChannelState::Initialized => {
                vec![ChannelEffect::SettleDetaches(Ok(()))]
            }
            ChannelState::Failed => vec![ChannelEffect::SettleDetaches(Err(self.failure_error()))],
            ChannelState::Detaching => Vec::new(),
            ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended => {
                let was_attaching = self.state == ChannelState::Attaching;
                self.attach_deadline = None;
                self.retry_at = None;
                let mut effects = Vec::new();
                if was_attaching {
                    effects.push(ChannelEffect::SettleAttaches(Err(ErrorInfo::channel_failed(
                        "attach superseded by detach",
                    ))));
                }
                if connected {
                    self.detach_deadline = Some(now + self.request_timeout);
                    effects.push(ChannelEffect::Emit(self.transition(
                        ChannelState::Detaching,
                        None,
                        None,
                    )));
                    effects.push(ChannelEffect::SendDetach);
                } else {
                    // nothing attached on the wire to undo
                    effects.push(ChannelEffect::Emit(self.transition(
                        ChannelState::Detached,
                        None,
                        None,
                    )));
                    effects.push(ChannelEffect::SettleDetaches(Ok(())));
                    effects.push(ChannelEffect::ClearPresence);
                }
                effects
            }
        }
    }

    /// Inbound ATTACHED.
    pub fn attached_received(&mut self, _now: Instant) -> Vec<ChannelEffect> {
        match self.state {
            ChannelState::Attaching | ChannelState::Suspended => {
                self.retry_attempts = 0;
                self.error_reason = None;
                self.attach_deadline = None;
                self.retry_at = None;
                vec![
                    ChannelEffect::Emit(self.transition(ChannelState::Attached, None, None)),
                    ChannelEffect::SettleAttaches(Ok(())),
                    ChannelEffect::FlushQueued,
                ]
            }
            _ => Vec::new(),
        }
    }

    /// Inbound DETACHED. Solicited while detaching; otherwise the server
    /// dropped the attachment and we re-attach immediately.
    pub fn detached_received(&mut self, now: Instant, connected: bool) -> Vec<ChannelEffect> {
        match self.state {
            ChannelState::Detaching => {
                self.detach_deadline = None;
                vec![
                    ChannelEffect::Emit(self.transition(ChannelState::Detached, None, None)),
                    ChannelEffect::SettleDetaches(Ok(())),
                    ChannelEffect::ClearPresence,
                ]
            }
            ChannelState::Attached | ChannelState::Attaching | ChannelState::Suspended => {
                self.retry_attempts += 1;
                let mut effects = self.start_attach(now, connected);
                effects.push(ChannelEffect::ClearPresence);
                effects
            }
            _ => Vec::new(),
        }
    }

    /// Inbound ERROR addressed to this channel.
    pub fn error_received(&mut self, now: Instant, err: ErrorInfo) -> Vec<ChannelEffect> {
        match self.state {
            ChannelState::Attaching
            | ChannelState::Attached
            | ChannelState::Detaching
            | ChannelState::Suspended => {
                if err.is_fatal_for_channel() {
                    self.fail(err)
                } else {
                    self.retry_attempts += 1;
                    self.error_reason = Some(err.clone());
                    self.attach_deadline = None;
                    self.detach_deadline = None;
                    let delay = retry_delay(self.retry_attempts, self.retry_timeout);
                    self.retry_at = Some(now + delay);
                    vec![
                        ChannelEffect::Emit(self.transition(
                            ChannelState::Suspended,
                            Some(err.clone()),
                            Some(delay),
                        )),
                        ChannelEffect::SettleAttaches(Err(err.clone())),
                        ChannelEffect::RejectQueued(err),
                    ]
                }
            }
            _ => Vec::new(),
        }
    }

    /// The connection is connected (again); re-send the ATTACH for channels
    /// still waiting and wake suspended channels.
    pub fn connection_connected(&mut self, now: Instant) -> Vec<ChannelEffect> {
        match self.state {
            ChannelState::Attaching => {
                self.attach_deadline = Some(now + self.request_timeout);
                vec![ChannelEffect::SendAttach]
            }
            ChannelState::Suspended => {
                self.retry_at = None;
                self.start_attach(now, true)
            }
            _ => Vec::new(),
        }
    }

    /// The connection's outage escalated to suspended.
    pub fn connection_suspended(&mut self, _now: Instant, err: ErrorInfo) -> Vec<ChannelEffect> {
        match self.state {
            ChannelState::Attaching | ChannelState::Attached => {
                self.error_reason = Some(err.clone());
                self.attach_deadline = None;
                self.retry_at = None;
                vec![
                    ChannelEffect::Emit(self.transition(
                        ChannelState::Suspended,
                        Some(err.clone()),
                        None,
                    )),
                    ChannelEffect::SettleAttaches(Err(err.clone())),
                    ChannelEffect::RejectQueued(err),
                ]
            }
            _ => Vec::new(),
        }
    }

    /// The connection failed terminally.
    pub fn connection_failed(&mut self, _now: Instant, err: ErrorInfo) -> Vec<ChannelEffect> {
        match self.state {
            ChannelState::Failed | ChannelState::Detached => Vec::new(),
            _ => self.fail(err),
        }
    }

    /// The connection was closed by the caller.
    pub fn connection_closed(&mut self, _now: Instant) -> Vec<ChannelEffect> {
        match self.state {
            ChannelState::Attaching
            | ChannelState::Attached
            | ChannelState::Detaching
            | ChannelState::Suspended => {
                let err = ErrorInfo::closed("connection closed by client");
                self.attach_deadline = None;
                self.detach_deadline = None;
                self.retry_at = None;
                vec![
                    ChannelEffect::Emit(self.transition(ChannelState::Detached, None, None)),
                    ChannelEffect::SettleAttaches(Err(err.clone())),
                    ChannelEffect::SettleDetaches(Ok(())),
                    ChannelEffect::RejectQueued(err),
                    ChannelEffect::ClearPresence,
                ]
            }
            _ => Vec::new(),
        }
    }

    /// Surface elapsed deadlines. Called from the driver tick.
    pub fn poll_timers(&mut self, now: Instant, connected: bool) -> Vec<ChannelEffect> {
        match self.state {
            ChannelState::Attaching if elapsed(self.attach_deadline, now) => {
                self.attach_deadline = None;
                self.retry_attempts += 1;
                let err = ErrorInfo::attach_timed_out(format!(
                    "attach on channel {} timed out",
                    self.name
                ));
                self.error_reason = Some(err.clone());
                let delay = retry_delay(self.retry_attempts, self.retry_timeout);
                self.retry_at = Some(now + delay);
                vec![
                    ChannelEffect::Emit(self.transition(
                        ChannelState::Suspended,
                        Some(err.clone()),
                        Some(delay),
                    )),
                    ChannelEffect::SettleAttaches(Err(err.clone())),
                    ChannelEffect::RejectQueued(err),
                ]
            }
            ChannelState::Detaching if elapsed(self.detach_deadline, now) => {
                self.detach_deadline = None;
                let err =
                    ErrorInfo::attach_timed_out(format!("detach on channel {} timed out", self.name));
                vec![
                    ChannelEffect::Emit(self.transition(ChannelState::Attached, None, None)),
                    ChannelEffect::SettleDetaches(Err(err)),
                ]
            }
            ChannelState::Suspended if connected && elapsed(self.retry_at, now) => {
                self.retry_at = None;
                self.start_attach(now, true)
            }
            _ => Vec::new(),
        }
    }

    fn start_attach(&mut self, now: Instant, connected: bool) -> Vec<ChannelEffect> {
        self.retry_at = None;
        self.attach_deadline = Some(now + self.request_timeout);
        let mut effects = vec![ChannelEffect::Emit(self.transition(
            ChannelState::Attaching,
            None,
            None,
        ))];
        if connected {
            effects.push(ChannelEffect::SendAttach);
        }
        effects
    }

    fn fail(&mut self, err: ErrorInfo) -> Vec<ChannelEffect> {
        self.error_reason = Some(err.clone());
        self.attach_deadline = None;
        self.detach_deadline = None;
        self.retry_at = None;
        vec![
            ChannelEffect::Emit(self.transition(ChannelState::Failed, Some(err.clone()), None)),
            ChannelEffect::SettleAttaches(Err(err.clone())),
            ChannelEffect::SettleDetaches(Err(err.clone())),
            ChannelEffect::RejectQueued(err),
            ChannelEffect::ClearPresence,
        ]
    }

    fn transition(
        &mut self,
        to: ChannelState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) -> ChannelStateChange {
        let change = ChannelStateChange {
            previous: self.state,
            current: to,
            reason,
            retry_in,
        };
        self.state = to;
        change
    }
}

fn elapsed(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|d| now >= d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulselink_protocol::codes;

    fn machine() -> ChannelStateMachine {
        ChannelStateMachine::new(
            "orders",
            Duration::from_millis(150),
            Duration::from_millis(50),
        )
    }

    fn emitted(effects: &[ChannelEffect]) -> Vec<ChannelState> {
        effects
            .iter()
            .filter_map(|e| match e {
                ChannelEffect::Emit(change) => Some(change.current),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn attach_timeout_rejects_suspends_then_reattaches() {
        let mut m = machine();
        let t0 = Instant::now();
        let effects = m.attach_requested(t0, true);
        assert_eq!(emitted(&effects), vec![ChannelState::Attaching]);
        assert!(effects.iter().any(|e| matches!(e, ChannelEffect::SendAttach)));

        let effects = m.poll_timers(t0 + Duration::from_millis(50), true);
        assert_eq!(m.state(), ChannelState::Suspended);
        assert_eq!(m.retry_attempts(), 1);
        let rejection = effects
            .iter()
            .find_map(|e| match e {
                ChannelEffect::SettleAttaches(Err(err)) => Some(err.clone()),
                _ => None,
            })
            .expect("pending attach rejects on timeout");
        assert_eq!(rejection.code, codes::ATTACH_TIMED_OUT);
        assert_eq!(rejection.status_code, 408);

        // autonomous re-attach after the channel backoff delay; first
        // attempt's jittered delay lies in [120, 150] ms
        assert!(m.poll_timers(t0 + Duration::from_millis(160), true).is_empty());
        let effects = m.poll_timers(t0 + Duration::from_millis(201), true);
        assert_eq!(m.state(), ChannelState::Attaching);
        assert!(effects.iter().any(|e| matches!(e, ChannelEffect::SendAttach)));
    }

    #[test]
    fn suspended_channel_waits_for_connection_before_reattach() {
        let mut m = machine();
        let t0 = Instant::now();
        m.attach_requested(t0, true);
        m.poll_timers(t0 + Duration::from_millis(50), true);
        assert_eq!(m.state(), ChannelState::Suspended);

        // retry deadline passes while the connection is down: hold
        assert!(m.poll_timers(t0 + Duration::from_secs(5), false).is_empty());
        assert_eq!(m.state(), ChannelState::Suspended);

        let effects = m.connection_connected(t0 + Duration::from_secs(6));
        assert_eq!(m.state(), ChannelState::Attaching);
        assert!(effects.iter().any(|e| matches!(e, ChannelEffect::SendAttach)));
    }

    #[test]
    fn attached_resets_retry_counter_and_flushes_queue() {
        let mut m = machine();
        let t0 = Instant::now();
        m.attach_requested(t0, true);
        m.poll_timers(t0 + Duration::from_millis(50), true);
        m.poll_timers(t0 + Duration::from_millis(210), true);
        assert_eq!(m.retry_attempts(), 1);

        let effects = m.attached_received(t0 + Duration::from_millis(220));
        assert_eq!(m.state(), ChannelState::Attached);
        assert_eq!(m.retry_attempts(), 0);
        assert!(effects.iter().any(|e| matches!(e, ChannelEffect::FlushQueued)));
    }

    #[test]
    fn terminal_error_fails_the_channel_until_explicit_attach() {
        let mut m = machine();
        let t0 = Instant::now();
        m.attach_requested(t0, true);
        let denied = ErrorInfo::new(40160, 401, "permission denied");
        let effects = m.error_received(t0, denied.clone());
        assert_eq!(m.state(), ChannelState::Failed);
        assert_eq!(m.error_reason(), Some(&denied));
        assert!(effects
            .iter()
            .any(|e| matches!(e, ChannelEffect::RejectQueued(err) if *err == denied)));

        // failed is terminal for everything except an explicit new attach
        assert!(m.poll_timers(t0 + Duration::from_secs(60), true).is_empty());
        let effects = m.attach_requested(t0 + Duration::from_secs(61), true);
        assert_eq!(m.state(), ChannelState::Attaching);
        assert!(effects.iter().any(|e| matches!(e, ChannelEffect::SendAttach)));
    }

    #[test]
    fn non_fatal_error_suspends_with_retry() {
        let mut m = machine();
        let t0 = Instant::now();
        m.attach_requested(t0, true);
        m.attached_received(t0);
        let effects = m.error_received(t0, ErrorInfo::new(50000, 500, "server error"));
        assert_eq!(m.state(), ChannelState::Suspended);
        let change = effects
            .iter()
            .find_map(|e| match e {
                ChannelEffect::Emit(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        assert!(change.retry_in.is_some());
    }

    #[test]
    fn detach_on_detached_is_a_resolved_no_op() {
        let mut m = machine();
        let t0 = Instant::now();
        let effects = m.detach_requested(t0, true);
        assert!(matches!(effects[0], ChannelEffect::SettleDetaches(Ok(()))));
        assert!(!effects.iter().any(|e| matches!(e, ChannelEffect::SendDetach)));
        assert_eq!(m.state(), ChannelState::Initialized);
    }

    #[test]
    fn detach_cycle_round_trips() {
        let mut m = machine();
        let t0 = Instant::now();
        m.attach_requested(t0, true);
        m.attached_received(t0);

        let effects = m.detach_requested(t0, true);
        assert_eq!(m.state(), ChannelState::Detaching);
        assert!(effects.iter().any(|e| matches!(e, ChannelEffect::SendDetach)));

        let effects = m.detached_received(t0 + Duration::from_millis(10), true);
        assert_eq!(m.state(), ChannelState::Detached);
        assert!(effects
            .iter()
            .any(|e| matches!(e, ChannelEffect::SettleDetaches(Ok(())))));
        assert!(effects.iter().any(|e| matches!(e, ChannelEffect::ClearPresence)));
    }

    #[test]
    fn unsolicited_detached_triggers_reattach() {
        let mut m = machine();
        let t0 = Instant::now();
        m.attach_requested(t0, true);
        m.attached_received(t0);

        let effects = m.detached_received(t0 + Duration::from_secs(1), true);
        assert_eq!(m.state(), ChannelState::Attaching);
        assert_eq!(m.retry_attempts(), 1);
        assert!(effects.iter().any(|e| matches!(e, ChannelEffect::SendAttach)));
        assert!(effects.iter().any(|e| matches!(e, ChannelEffect::ClearPresence)));
    }

    #[test]
    fn connection_failure_reaches_every_non_detached_channel() {
        let mut m = machine();
        let t0 = Instant::now();
        m.attach_requested(t0, true);
        m.attached_received(t0);
        let err = ErrorInfo::unauthorized("token revoked");
        let effects = m.connection_failed(t0, err.clone());
        assert_eq!(m.state(), ChannelState::Failed);
        assert_eq!(m.failure_error(), err);
        assert!(!effects.is_empty());

        // already-detached channels are left alone
        let mut d = machine();
        d.attach_requested(t0, true);
        d.attached_received(t0);
        d.detach_requested(t0, true);
        d.detached_received(t0, true);
        assert!(d.connection_failed(t0, err).is_empty());
        assert_eq!(d.state(), ChannelState::Detached);
    }

    #[test]
    fn connection_close_detaches_live_channels() {
        let mut m = machine();
        let t0 = Instant::now();
        m.attach_requested(t0, true);
        m.attached_received(t0);
        let effects = m.connection_closed(t0);
        assert_eq!(m.state(), ChannelState::Detached);
        assert!(effects.iter().any(|e| matches!(
            e,
            ChannelEffect::SettleAttaches(Err(err)) if err.code == codes::CONNECTION_CLOSED
        )));
    }
}
