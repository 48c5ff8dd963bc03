//! Broker connection settings.

use chrono::{DateTime, Utc};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_PATH: &str = "/mqtt";
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and how to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Bare hostname, e.g. `a1b2c3-ats.iot.us-east-1.amazonaws.com`.
    pub endpoint: String,
    pub port: u16,
    /// `wss` when set, plain `ws` otherwise (local brokers and tests).
    pub tls: bool,
    pub path: String,
    pub region: String,
    /// Prefix of the per-connection MQTT client id.
    pub client_id_prefix: String,
    /// Zero disables keep-alive pings.
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// How long a QoS 1 publish may wait for PUBACK before the session is
    /// treated as lost.
    pub ack_timeout: Duration,
}

impl BrokerConfig {
    pub fn new(
        endpoint: impl Into<String>,
        region: impl Into<String>,
        client_id_prefix: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            port: DEFAULT_PORT,
            tls: true,
            path: DEFAULT_PATH.to_string(),
            region: region.into(),
            client_id_prefix: client_id_prefix.into(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls { "wss" } else { "ws" }
    }

    /// The WebSocket URL; the port is omitted when it is the scheme default.
    pub fn url(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            format!("{}://{}{}", self.scheme(), self.endpoint, self.path)
        } else {
            format!("{}://{}:{}{}", self.scheme(), self.endpoint, self.port, self.path)
        }
    }

    /// Client id for a connection made at `at`.
    ///
    /// The timestamp suffix keeps a reconnecting process from colliding with
    /// its own previous session on the broker.
    pub fn client_id(&self, at: DateTime<Utc>) -> String {
        format!("{}-{}", self.client_id_prefix, at.timestamp_millis())
    }

    /// Keep-alive as carried in CONNECT, saturating at the protocol maximum.
    ///
    /// The session pings on this same value.
    pub fn keep_alive_secs(&self) -> u16 {
        u16::try_from(self.keep_alive.as_secs()).unwrap_or(u16::MAX)
    }
}
