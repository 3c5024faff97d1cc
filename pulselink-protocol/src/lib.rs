//! Wire-level protocol model for the pulselink realtime client.
//!
//! A realtime connection exchanges discriminated [`ProtocolMessage`]
//! envelopes carrying connection control, channel control, acknowledgments
//! and user data. This crate defines the envelope, its action discriminator,
//! the wire error structure and the byte codec boundary; it knows nothing
//! about transports or connection state.

mod action;
mod error_info;
mod message;

pub mod codec;

pub use action::Action;
pub use error_info::{codes, ErrorInfo};
pub use message::{
    ConnectionDetails, Message, PresenceAction, PresenceMessage, ProtocolMessage,
};
