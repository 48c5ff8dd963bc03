//! Error types for the broker client.

use chrono::{DateTime, Utc};
use rumqttc::{ConnectReturnCode, ConnectionError};
use std::time::Duration;

/// Credential resolution or request signing failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no credentials available: {0}")]
    Missing(String),
    #[error("credentials expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("credential provider failed: {0}")]
    Provider(String),
    #[error("request cannot be signed: {0}")]
    InvalidRequest(String),
}

/// Establishing the broker session failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("transport error: {0}")]
    Transport(#[source] Box<ConnectionError>),
    #[error("broker refused the session: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("protocol error during session establishment: {0}")]
    Protocol(String),
    #[error("timed out after {0:?} establishing the session")]
    Timeout(Duration),
    #[error("connection attempt cancelled by disconnect")]
    Cancelled,
}

/// A single publish failed. Never fatal to the session owner.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("not connected to the broker")]
    NotConnected,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("no PUBACK within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("too many unacknowledged publishes in flight")]
    TooManyInFlight,
}

/// A QoS level this client does not publish at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unsupported QoS level {0}; expected 0 or 1")]
pub struct UnsupportedQos(pub u8);
