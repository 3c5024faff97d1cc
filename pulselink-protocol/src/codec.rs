//! Byte codec boundary.
//!
//! Transports own framing; this module only converts between a framed byte
//! payload and a [`ProtocolMessage`]. JSON is the single wire encoding.

use crate::ProtocolMessage;
use anyhow::{Context, Result};
use bytes::Bytes;

pub fn encode(msg: &ProtocolMessage) -> Result<Bytes> {
    let raw = serde_json::to_vec(msg).context("encode protocol message")?;
    Ok(Bytes::from(raw))
}

pub fn decode(raw: &[u8]) -> Result<ProtocolMessage> {
    serde_json::from_slice(raw).context("decode protocol message")
}
