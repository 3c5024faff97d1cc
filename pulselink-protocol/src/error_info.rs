use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Well-known error codes used across the client runtime.
///
/// Codes outside these ranges may still arrive from the server and are
/// passed through to callers untouched.
pub mod codes {
    /// Invalid or expired credentials; fatal for the connection.
    pub const UNAUTHORIZED: u32 = 40100;
    /// The server cannot serve this host; retry against a fallback host.
    pub const HOST_UNSERVICEABLE: u32 = 50002;
    /// The outage outlasted `connectionStateTtl`.
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    /// Transient transport break.
    pub const CONNECTION_DISCONNECTED: u32 = 80003;
    /// Connect or idle timeout.
    pub const CONNECTION_TIMED_OUT: u32 = 80014;
    /// User-initiated close.
    pub const CONNECTION_CLOSED: u32 = 80017;
    /// Operation attempted on a failed channel.
    pub const CHANNEL_OPERATION_FAILED: u32 = 90001;
    /// ATTACHED was not received within the request timeout.
    pub const ATTACH_TIMED_OUT: u32 = 90007;
}

/// Structured error carried in ERROR/NACK envelopes and surfaced to callers.
///
/// Every public operation in the runtime settles with either a success or
/// one of these; `status_code` follows HTTP semantics (408 timeout, 401/403
/// auth, 5xx server-side).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: u32,
    pub status_code: u16,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }

    /// Placement-constraint class: the server signalled it cannot serve the
    /// host we connected to. Triggers fallback-host selection rather than a
    /// retry cycle against the primary.
    #[inline]
    pub fn is_placement_constraint(&self) -> bool {
        (50000..50100).contains(&self.code) && (500..600).contains(&self.status_code)
    }

    /// Auth-class errors are fatal for the connection: no automatic retry,
    /// the caller must reconnect explicitly.
    #[inline]
    pub fn is_fatal_for_connection(&self) -> bool {
        (40100..40300).contains(&self.code) || self.status_code == 401 || self.status_code == 403
    }

    /// Channel-terminal errors (e.g. permission denied) move the channel to
    /// `failed`; anything else (5xx, timeouts) suspends it with retry.
    #[inline]
    pub fn is_fatal_for_channel(&self) -> bool {
        (400..500).contains(&self.status_code) && self.status_code != 408
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(codes::UNAUTHORIZED, 401, message)
    }

    pub fn suspended(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_SUSPENDED, 503, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_DISCONNECTED, 503, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_TIMED_OUT, 408, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_CLOSED, 400, message)
    }

    pub fn channel_failed(message: impl Into<String>) -> Self {
        Self::new(codes::CHANNEL_OPERATION_FAILED, 400, message)
    }

    pub fn attach_timed_out(message: impl Into<String>) -> Self {
        Self::new(codes::ATTACH_TIMED_OUT, 408, message)
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (code {}, status {})",
            self.message, self.code, self.status_code
        )
    }
}

impl std::error::Error for ErrorInfo {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_constraint_requires_code_and_status() {
        assert!(ErrorInfo::new(codes::HOST_UNSERVICEABLE, 503, "go away").is_placement_constraint());
        // 5xx status alone is not enough
        assert!(!ErrorInfo::new(80003, 503, "broke").is_placement_constraint());
        // placement code with a 4xx status is not a placement constraint
        assert!(!ErrorInfo::new(codes::HOST_UNSERVICEABLE, 400, "bad").is_placement_constraint());
    }

    #[test]
    fn auth_errors_are_connection_fatal() {
        assert!(ErrorInfo::unauthorized("bad token").is_fatal_for_connection());
        assert!(!ErrorInfo::disconnected("blip").is_fatal_for_connection());
    }

    #[test]
    fn channel_fatal_excludes_timeouts() {
        assert!(ErrorInfo::new(40160, 401, "denied").is_fatal_for_channel());
        assert!(!ErrorInfo::attach_timed_out("slow").is_fatal_for_channel());
        assert!(!ErrorInfo::new(50000, 500, "server").is_fatal_for_channel());
    }
}
