//! Realtime publish/subscribe client runtime.
//!
//! Maintains one logical connection and a set of logical channels on top of
//! an unreliable, switchable physical transport, preserving message ordering
//! and at-least-once delivery while recovering automatically from host
//! failures, network drops and idle timeouts.
//!
//! The moving parts:
//! - [`connection`] — the connection state machine and its driver task:
//!   transport lifecycle, fallback-host selection, retry scheduling,
//!   idle-timeout detection and protocol-message dispatch.
//! - [`channel`] — per-channel attach/detach state machines.
//! - [`ledger`] — the pending-message ledger correlating outbound batches
//!   with cumulative ACK/NACK.
//! - [`transport`] — the seam real transports implement.
//! - [`Realtime`] and its handles — the thin API surface on top.

pub mod backoff;
pub mod channel;
mod client;
pub mod config;
pub mod connection;
pub mod ledger;
pub mod presence;
pub mod transport;

pub use channel::{ChannelState, ChannelStateChange};
pub use client::{Channel, Connection, Presence, Realtime};
pub use config::ClientOptions;
pub use connection::{ConnectionState, ConnectionStateChange};
pub use ledger::PendingLedger;
pub use presence::PresenceMember;
pub use transport::{
    Transport, TransportError, TransportEvent, TransportFactory, TransportKind, TransportParams,
};

pub use pulselink_protocol as protocol;
