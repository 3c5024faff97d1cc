use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client configuration.
///
/// All timeouts are in milliseconds on the wire-facing serde surface;
/// `Duration` accessors are provided for the runtime. Fields default to
/// production values and can be overridden either via deserialization or
/// the fluent setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOptions {
    /// Host tried first on every fresh connection attempt cycle.
    pub primary_host: String,

    /// Alternate hosts tried, in order, after placement-constraint failures.
    #[serde(default)]
    pub fallback_hosts: Vec<String>,

    /// Transport kinds in preference order.
    #[serde(default = "ClientOptions::default_transports")]
    pub transports: Vec<TransportKind>,

    /// Credential forwarded to transports at connect time.
    #[serde(default)]
    pub token: Option<String>,

    /// Whether publishes are queued while the connection is temporarily
    /// down. When false, publishing while not connected fails immediately.
    #[serde(default = "ClientOptions::default_queue_messages")]
    pub queue_messages: bool,

    #[serde(default = "ClientOptions::default_disconnected_retry_timeout_ms")]
    pub disconnected_retry_timeout_ms: u64,

    #[serde(default = "ClientOptions::default_suspended_retry_timeout_ms")]
    pub suspended_retry_timeout_ms: u64,

    #[serde(default = "ClientOptions::default_channel_retry_timeout_ms")]
    pub channel_retry_timeout_ms: u64,

    /// Timeout for individual realtime requests: connect handshakes, attach
    /// and detach confirmations, and the idle-detection grace margin.
    #[serde(default = "ClientOptions::default_realtime_request_timeout_ms")]
    pub realtime_request_timeout_ms: u64,

    /// How long repeated disconnections may last before the connection
    /// escalates to `suspended`.
    #[serde(default = "ClientOptions::default_connection_state_ttl_ms")]
    pub connection_state_ttl_ms: u64,
}

impl ClientOptions {
    pub fn new(primary_host: impl Into<String>) -> Self {
        Self {
            primary_host: primary_host.into(),
            fallback_hosts: Vec::new(),
            transports: Self::default_transports(),
            token: None,
            queue_messages: Self::default_queue_messages(),
            disconnected_retry_timeout_ms: Self::default_disconnected_retry_timeout_ms(),
            suspended_retry_timeout_ms: Self::default_suspended_retry_timeout_ms(),
            channel_retry_timeout_ms: Self::default_channel_retry_timeout_ms(),
            realtime_request_timeout_ms: Self::default_realtime_request_timeout_ms(),
            connection_state_ttl_ms: Self::default_connection_state_ttl_ms(),
        }
    }

    fn default_transports() -> Vec<TransportKind> {
        vec![TransportKind::WebSocket, TransportKind::Comet]
    }

    fn default_queue_messages() -> bool {
        true
    }

    fn default_disconnected_retry_timeout_ms() -> u64 {
        15_000
    }

    fn default_suspended_retry_timeout_ms() -> u64 {
        30_000
    }

    fn default_channel_retry_timeout_ms() -> u64 {
        15_000
    }

    fn default_realtime_request_timeout_ms() -> u64 {
        10_000
    }

    fn default_connection_state_ttl_ms() -> u64 {
        120_000
    }

    pub fn fallback_hosts(mut self, hosts: Vec<String>) -> Self {
        self.fallback_hosts = hosts;
        self
    }

    pub fn transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = transports;
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn queue_messages(mut self, on: bool) -> Self {
        self.queue_messages = on;
        self
    }

    pub fn disconnected_retry_timeout(mut self, millis: u64) -> Self {
        self.disconnected_retry_timeout_ms = millis;
        self
    }

    pub fn suspended_retry_timeout(mut self, millis: u64) -> Self {
        self.suspended_retry_timeout_ms = millis;
        self
    }

    pub fn channel_retry_timeout(mut self, millis: u64) -> Self {
        self.channel_retry_timeout_ms = millis;
        self
    }

    pub fn realtime_request_timeout(mut self, millis: u64) -> Self {
        self.realtime_request_timeout_ms = millis;
        self
    }

    pub fn connection_state_ttl(mut self, millis: u64) -> Self {
        self.connection_state_ttl_ms = millis;
        self
    }

    pub fn disconnected_retry(&self) -> Duration {
        Duration::from_millis(self.disconnected_retry_timeout_ms)
    }

    pub fn suspended_retry(&self) -> Duration {
        Duration::from_millis(self.suspended_retry_timeout_ms)
    }

    pub fn channel_retry(&self) -> Duration {
        Duration::from_millis(self.channel_retry_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.realtime_request_timeout_ms)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_state_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_on_deserialization() {
        let opts: ClientOptions =
            serde_json::from_str(r#"{"primaryHost": "realtime.example.com"}"#).unwrap();
        assert_eq!(opts.primary_host, "realtime.example.com");
        assert!(opts.queue_messages);
        assert_eq!(opts.disconnected_retry_timeout_ms, 15_000);
        assert_eq!(
            opts.transports,
            vec![TransportKind::WebSocket, TransportKind::Comet]
        );
    }

    #[test]
    fn fluent_setters_override_defaults() {
        let opts = ClientOptions::new("realtime.example.com")
            .fallback_hosts(vec!["a.example.com".into(), "b.example.com".into()])
            .queue_messages(false)
            .realtime_request_timeout(50);
        assert_eq!(opts.fallback_hosts.len(), 2);
        assert!(!opts.queue_messages);
        assert_eq!(opts.request_timeout(), Duration::from_millis(50));
    }
}
