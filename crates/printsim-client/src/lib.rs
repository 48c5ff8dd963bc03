//! Authenticated MQTT-over-WebSocket client for printsim.
//!
//! The broker is reached with a SigV4-signed WebSocket upgrade carrying the
//! `mqtt` subprotocol, followed by an MQTT 3.1.1 session run by `rumqttc`.
//! [`ConnectionManager`] owns that session and implements [`Publisher`].

mod config;
mod connection;
mod credentials;
mod error;
mod signer;

pub use config::{
    BrokerConfig, DEFAULT_ACK_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEP_ALIVE, DEFAULT_PATH,
    DEFAULT_PORT,
};
pub use connection::{Ack, ConnectionManager, ConnectionState, Publisher, QoS};
pub use credentials::{
    Credentials, DefaultCredentials, EnvironmentCredentials, ProfileCredentials,
    ProvideCredentials, StaticCredentials,
};
pub use error::{AuthError, ConnectError, PublishError, UnsupportedQos};
pub use rumqttc::ConnectReturnCode;
pub use signer::{IOT_SERVICE, PendingRequest, SigV4Signer};
