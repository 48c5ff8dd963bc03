//! Broker connection lifecycle.
//!
//! [`ConnectionManager`] owns at most one MQTT session, driven by a
//! `rumqttc` event loop. The WebSocket upgrade is SigV4-signed through the
//! event loop's request modifier. Once CONNACK arrives the event loop moves
//! into a session task that pairs outgoing PUBLISH events with waiting
//! callers in send order and resolves QoS 1 publishes on PUBACK.

use crate::config::BrokerConfig;
use crate::credentials::{Credentials, ProvideCredentials};
use crate::error::UnsupportedQos;
use crate::signer::{IOT_SERVICE, PendingRequest, SigV4Signer};
use crate::{AuthError, ConnectError, PublishError};
use chrono::Utc;
use http::header::{HeaderName, HeaderValue};
use percent_encoding::percent_decode_str;
use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing,
    Transport,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Capacity of the request queue between callers and the event loop.
const REQUEST_CAPACITY: usize = 64;
/// AWS IoT Core rejects MQTT packets above 128 KiB.
const MAX_PACKET_SIZE: usize = 128 * 1024;

/// Lifecycle of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session. `connect()` may be called.
    Disconnected,
    /// An attempt is in flight.
    Connecting,
    /// CONNACK accepted; publishes are accepted.
    Connected,
    /// The last attempt failed. `connect()` may be called again.
    Failed,
}

/// Delivery guarantee of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl TryFrom<u8> for QoS {
    type Error = UnsupportedQos;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(UnsupportedQos(other)),
        }
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

/// Broker acknowledgment of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// The PUBACK'd packet id; `None` for QoS 0, which has no ack.
    pub packet_id: Option<u16>,
}

/// Anything that can deliver a payload to a topic.
pub trait Publisher: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
    ) -> impl Future<Output = Result<Ack, PublishError>> + Send;
}

type Reply = oneshot::Sender<Result<Ack, PublishError>>;

/// Publishes queued on the event loop, in the order it will send them.
struct Outbox {
    client: AsyncClient,
    sending: VecDeque<Reply>,
    open: bool,
}

impl Outbox {
    fn push(&mut self, topic: &str, payload: &[u8], qos: QoS, reply: Reply) -> Result<(), PublishError> {
        if !self.open {
            return Err(PublishError::NotConnected);
        }
        self.client
            .try_publish(topic, qos.into(), false, payload.to_vec())
            .map_err(|err| match err {
                ClientError::TryRequest(_) => PublishError::TooManyInFlight,
                other => PublishError::Transport(other.to_string()),
            })?;
        self.sending.push_back(reply);
        Ok(())
    }

    fn close(&mut self, reason: &str) {
        self.open = false;
        for reply in self.sending.drain(..) {
            let _ = reply.send(Err(PublishError::ConnectionLost(reason.to_string())));
        }
    }
}

struct SessionHandle {
    outbox: Arc<Mutex<Outbox>>,
    task: JoinHandle<()>,
    client_id: String,
}

/// Owns the single authenticated session to the broker.
pub struct ConnectionManager<P> {
    config: BrokerConfig,
    signer: Arc<SigV4Signer<P>>,
    state: Arc<watch::Sender<ConnectionState>>,
    session: Mutex<Option<SessionHandle>>,
}

impl<P: ProvideCredentials + 'static> ConnectionManager<P> {
    pub fn new(config: &BrokerConfig, provider: P) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config: config.clone(),
            signer: Arc::new(SigV4Signer::new(provider, config.region.clone(), IOT_SERVICE)),
            state: Arc::new(state),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions, including session loss.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_usable(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Client id of the current or most recent session.
    pub fn client_id(&self) -> Option<String> {
        lock(&self.session)
            .as_ref()
            .map(|session| session.client_id.clone())
    }

    /// Sign the upgrade, open the WebSocket and establish the MQTT session.
    ///
    /// While an attempt is in flight or a session is up, this returns the
    /// current state and does nothing else. A `disconnect()` that lands
    /// while the attempt is in flight wins: the new session is closed and
    /// [`ConnectError::Cancelled`] is returned.
    pub async fn connect(&self) -> Result<ConnectionState, ConnectError> {
        let mut busy = None;
        self.state.send_if_modified(|state| match *state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                busy = Some(*state);
                false
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                *state = ConnectionState::Connecting;
                true
            }
        });
        if let Some(state) = busy {
            tracing::debug!(?state, "connect skipped");
            return Ok(state);
        }

        let client_id = self.config.client_id(Utc::now());
        let session = match self.establish(&client_id).await {
            Ok(session) => session,
            Err(err) => {
                self.state.send_if_modified(|state| {
                    advance(state, ConnectionState::Connecting, ConnectionState::Failed)
                });
                return Err(err);
            }
        };

        let cancelled = {
            let mut slot = lock(&self.session);
            let promoted = self.state.send_if_modified(|state| {
                advance(state, ConnectionState::Connecting, ConnectionState::Connected)
            });
            if promoted {
                let outbox = Arc::clone(&session.outbox);
                let state = Arc::clone(&self.state);
                let task = tokio::spawn(async move {
                    if let Exit::Lost(reason) = session.run().await {
                        tracing::warn!("Broker session lost: {}", reason);
                    }
                    state.send_if_modified(|state| {
                        advance(state, ConnectionState::Connected, ConnectionState::Disconnected)
                    });
                });
                *slot = Some(SessionHandle {
                    outbox,
                    task,
                    client_id: client_id.clone(),
                });
                None
            } else {
                Some(session)
            }
        };

        if let Some(session) = cancelled {
            tracing::info!(client_id = %client_id, "Connection attempt cancelled; closing the new session");
            session.abandon(self.config.connect_timeout).await;
            return Err(ConnectError::Cancelled);
        }

        tracing::info!(client_id = %client_id, endpoint = %self.config.endpoint, "Connected to broker");
        Ok(ConnectionState::Connected)
    }

    /// Publish one message. Resolves on PUBACK for QoS 1, on write for QoS 0.
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<Ack, PublishError> {
        let outbox = lock(&self.session)
            .as_ref()
            .map(|session| Arc::clone(&session.outbox))
            .ok_or(PublishError::NotConnected)?;

        let (reply, response) = oneshot::channel();
        lock(&outbox).push(topic, payload, qos, reply)?;

        response
            .await
            .map_err(|_| PublishError::ConnectionLost("session ended before replying".into()))?
    }

    /// Send DISCONNECT and tear the session down. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let session = {
            let mut slot = lock(&self.session);
            self.state.send_replace(ConnectionState::Disconnected);
            slot.take()
        };
        let Some(mut session) = session else {
            return;
        };

        let requested = lock(&session.outbox).client.try_disconnect();
        if let Err(err) = requested {
            tracing::debug!("DISCONNECT not queued: {}", err);
        }
        match tokio::time::timeout(self.config.connect_timeout, &mut session.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("Session task ended abnormally: {}", err),
            Err(_) => {
                tracing::warn!("Session did not close within {:?}", self.config.connect_timeout);
                session.task.abort();
            }
        }
        tracing::info!(client_id = %session.client_id, "Disconnected from broker");
    }

    async fn establish(&self, client_id: &str) -> Result<Session, ConnectError> {
        let credentials = self.signer.credentials().await?;
        // Bad or expired keys fail here, before any network traffic.
        let preflight = PendingRequest::new(
            self.config.scheme(),
            "GET",
            self.config.endpoint.clone(),
            self.config.path.clone(),
        );
        self.signer.sign_at(preflight, &credentials, Utc::now())?;

        let (client, mut eventloop) =
            AsyncClient::new(self.mqtt_options(client_id, credentials), REQUEST_CAPACITY);

        tracing::debug!(url = %self.config.url(), client_id, "Opening websocket");
        let first = tokio::time::timeout(self.config.connect_timeout, eventloop.poll())
            .await
            .map_err(|_| ConnectError::Timeout(self.config.connect_timeout))?;
        match first {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {}
            Ok(other) => {
                return Err(ConnectError::Protocol(format!("expected CONNACK, got {other:?}")));
            }
            Err(ConnectionError::ConnectionRefused(code)) => return Err(ConnectError::Refused(code)),
            Err(err) => return Err(ConnectError::Transport(Box::new(err))),
        }

        Ok(Session::new(eventloop, client, self.config.ack_timeout))
    }

    fn mqtt_options(&self, client_id: &str, credentials: Credentials) -> MqttOptions {
        let transport = if self.config.tls {
            Transport::wss_with_default_config()
        } else {
            Transport::Ws
        };

        let mut options = MqttOptions::new(client_id, self.config.url(), self.config.port);
        options
            .set_transport(transport)
            .set_keep_alive(Duration::from_secs(u64::from(self.config.keep_alive_secs())))
            .set_clean_session(true)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        let signer = Arc::clone(&self.signer);
        options.set_request_modifier(move |request| {
            let signer = Arc::clone(&signer);
            let credentials = credentials.clone();
            async move { sign_upgrade(&signer, &credentials, request) }
        });
        options
    }
}

impl<P: ProvideCredentials + 'static> Publisher for ConnectionManager<P> {
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
    ) -> impl Future<Output = Result<Ack, PublishError>> + Send {
        ConnectionManager::publish(self, topic, payload, qos)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn advance(state: &mut ConnectionState, from: ConnectionState, to: ConnectionState) -> bool {
    let matches = *state == from;
    if matches {
        *state = to;
    }
    matches
}

/// Add SigV4 headers to the WebSocket upgrade built by the event loop.
///
/// The modifier hook cannot fail, so a signing error leaves the request
/// unsigned and the broker rejects the upgrade.
fn sign_upgrade<P: ProvideCredentials>(
    signer: &SigV4Signer<P>,
    credentials: &Credentials,
    mut request: http::Request<()>,
) -> http::Request<()> {
    let signed = pending_request(&request)
        .and_then(|pending| signer.sign_at(pending, credentials, Utc::now()))
        .and_then(|signed| apply_headers(&mut request, &signed));
    if let Err(err) = signed {
        tracing::warn!("Upgrade request left unsigned: {}", err);
    }
    request
}

/// The upgrade URL carries no query string; only the path is signed.
fn pending_request(request: &http::Request<()>) -> Result<PendingRequest, AuthError> {
    let uri = request.uri();
    let path = percent_decode_str(uri.path())
        .decode_utf8()
        .map_err(|err| AuthError::InvalidRequest(format!("upgrade path is not UTF-8: {err}")))?;
    let mut pending = PendingRequest::new(
        uri.scheme_str().unwrap_or("wss"),
        request.method().as_str(),
        uri.host().unwrap_or_default(),
        path,
    );
    for (name, value) in request.headers() {
        let value = value.to_str().map_err(|_| {
            AuthError::InvalidRequest(format!("header {name} is not visible ASCII"))
        })?;
        pending.set_header(name.as_str(), value);
    }
    Ok(pending)
}

fn apply_headers(request: &mut http::Request<()>, signed: &PendingRequest) -> Result<(), AuthError> {
    for (name, value) in &signed.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| AuthError::InvalidRequest(err.to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|err| AuthError::InvalidRequest(err.to_string()))?;
        request.headers_mut().insert(name, value);
    }
    Ok(())
}

enum Exit {
    Closed,
    Lost(String),
}

/// The event-loop-owning half of a live session.
struct Session {
    eventloop: EventLoop,
    outbox: Arc<Mutex<Outbox>>,
    /// QoS 1 publishes on the wire, with their PUBACK deadline.
    unacknowledged: HashMap<u16, (Reply, Option<Instant>)>,
    ack_timeout: Duration,
}

impl Session {
    fn new(eventloop: EventLoop, client: AsyncClient, ack_timeout: Duration) -> Self {
        Self {
            eventloop,
            outbox: Arc::new(Mutex::new(Outbox {
                client,
                sending: VecDeque::new(),
                open: true,
            })),
            unacknowledged: HashMap::new(),
            ack_timeout,
        }
    }

    /// Poll the event loop until the session closes or is lost.
    ///
    /// The event loop pings on a fixed keep-alive cadence regardless of
    /// outbound traffic and fails the poll when a PINGREQ is still
    /// unanswered at the next one. PUBACK deadlines are checked each time
    /// the loop yields an event.
    async fn run(mut self) -> Exit {
        let exit = loop {
            let event = match self.eventloop.poll().await {
                Ok(event) => event,
                Err(err) => break Exit::Lost(err.to_string()),
            };
            match event {
                Event::Outgoing(Outgoing::Publish(packet_id)) => self.sent(packet_id),
                Event::Incoming(Incoming::PubAck(ack)) => self.acknowledged(ack.pkid),
                Event::Incoming(Incoming::Publish(publish)) => {
                    tracing::debug!(topic = %publish.topic, "Ignoring inbound publish");
                }
                Event::Incoming(Incoming::Disconnect) => {
                    break Exit::Lost("broker sent DISCONNECT".into());
                }
                Event::Outgoing(Outgoing::Disconnect) => break Exit::Closed,
                event => tracing::trace!(?event, "mqtt event"),
            }
            if self.expire_unacknowledged() {
                break Exit::Lost(format!("no PUBACK within {:?}", self.ack_timeout));
            }
        };

        let reason = match &exit {
            Exit::Closed => "session closed".to_string(),
            Exit::Lost(reason) => reason.clone(),
        };
        lock(&self.outbox).close(&reason);
        for (_, (reply, _)) in self.unacknowledged.drain() {
            let _ = reply.send(Err(PublishError::ConnectionLost(reason.clone())));
        }
        exit
    }

    /// A PUBLISH hit the wire; `packet_id` is zero for QoS 0.
    fn sent(&mut self, packet_id: u16) {
        let reply = lock(&self.outbox).sending.pop_front();
        let Some(reply) = reply else {
            tracing::debug!(packet_id, "PUBLISH with no waiting caller");
            return;
        };
        if packet_id == 0 {
            let _ = reply.send(Ok(Ack { packet_id: None }));
        } else {
            let deadline = Instant::now().checked_add(self.ack_timeout);
            self.unacknowledged.insert(packet_id, (reply, deadline));
        }
    }

    fn acknowledged(&mut self, packet_id: u16) {
        match self.unacknowledged.remove(&packet_id) {
            Some((reply, _)) => {
                let _ = reply.send(Ok(Ack {
                    packet_id: Some(packet_id),
                }));
            }
            None => tracing::debug!(packet_id, "PUBACK for unknown packet id"),
        }
    }

    /// Fail publishes past their PUBACK deadline. Returns whether any were.
    fn expire_unacknowledged(&mut self) -> bool {
        let now = Instant::now();
        let expired: Vec<u16> = self
            .unacknowledged
            .iter()
            .filter(|(_, (_, deadline))| deadline.is_some_and(|deadline| deadline <= now))
            .map(|(packet_id, _)| *packet_id)
            .collect();
        for packet_id in &expired {
            if let Some((reply, _)) = self.unacknowledged.remove(packet_id) {
                let _ = reply.send(Err(PublishError::Timeout(self.ack_timeout)));
            }
        }
        !expired.is_empty()
    }

    /// Close a session nobody will use.
    async fn abandon(self, grace: Duration) {
        let requested = lock(&self.outbox).client.try_disconnect();
        if let Err(err) = requested {
            tracing::debug!("DISCONNECT not queued: {}", err);
            return;
        }
        if tokio::time::timeout(grace, self.run()).await.is_err() {
            tracing::debug!("Abandoned session did not close within {:?}", grace);
        }
    }
}
