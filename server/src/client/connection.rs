//! Client half of the socket connection: handshake, typed event channels,
//! reconnect with backoff, and re-subscription of ride rooms.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::auth::Role;
use crate::presence::PresenceCount;
use crate::proto::{
    ClientMessage, DriverAvailabilityUpdate, NewRideRequest, RideAcceptAck, RideAcceptRequest,
    RideStatusChanged, ServerMessage,
};
use crate::ws::Room;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type AckReply = oneshot::Sender<Result<RideAcceptAck, ClientError>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Socket endpoint, e.g. `ws://127.0.0.1:4000/ws`.
    pub url: String,
    pub token: String,
    pub handshake_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub ack_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: &str, token: &str) -> Self {
        Self {
            url: url.to_string(),
            token: token.to_string(),
            handshake_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
            ack_timeout: Duration::from_secs(15),
        }
    }

    fn endpoint(&self) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.url, sep, self.token)
    }
}

/// Who the client claims to be. Must match the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server refused the token or the claimed identity. Terminal.
    #[error("identity rejected ({code}): {reason}")]
    Identity { code: u16, reason: String },
    #[error("no handshake ack within the timeout")]
    HandshakeTimeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection is closed")]
    Closed,
    #[error("connection lost before the server answered")]
    ConnectionLost,
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("only ride rooms can be subscribed: {0}")]
    InvalidRoom(String),
}

impl ClientError {
    /// Whether reconnecting or retrying can help.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::Identity { .. } | Self::Closed | Self::InvalidRoom(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Close codes the server uses for identity faults.
fn is_identity_fault(code: u16) -> bool {
    (4001..=4003).contains(&code)
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connected { connection_id: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Events sent while offline are gone; refetch the REST snapshot.
    Reconnected { connection_id: String },
    AuthRejected { code: u16, reason: String },
    GaveUp { attempts: u32 },
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RideEvent {
    NewRequest(NewRideRequest),
    StatusChanged(RideStatusChanged),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    ActiveUsers(PresenceCount),
    DriverAvailability(DriverAvailabilityUpdate),
}

/// Receiving ends of the per-category event channels.
pub struct ClientEvents {
    /// Raw notification payloads; feed them to
    /// [`NotificationStore::merge_raw`](crate::client::store::NotificationStore::merge_raw).
    pub notifications: mpsc::UnboundedReceiver<Value>,
    pub rides: mpsc::UnboundedReceiver<RideEvent>,
    pub presence: mpsc::UnboundedReceiver<PresenceEvent>,
    pub lifecycle: mpsc::UnboundedReceiver<LifecycleEvent>,
}

struct EventSinks {
    notifications: mpsc::UnboundedSender<Value>,
    rides: mpsc::UnboundedSender<RideEvent>,
    presence: mpsc::UnboundedSender<PresenceEvent>,
    lifecycle: mpsc::UnboundedSender<LifecycleEvent>,
}

fn event_channels() -> (EventSinks, ClientEvents) {
    let (notifications_tx, notifications) = mpsc::unbounded_channel();
    let (rides_tx, rides) = mpsc::unbounded_channel();
    let (presence_tx, presence) = mpsc::unbounded_channel();
    let (lifecycle_tx, lifecycle) = mpsc::unbounded_channel();
    (
        EventSinks {
            notifications: notifications_tx,
            rides: rides_tx,
            presence: presence_tx,
            lifecycle: lifecycle_tx,
        },
        ClientEvents {
            notifications,
            rides,
            presence,
            lifecycle,
        },
    )
}

/// A decoded server frame. Notification payloads stay raw so malformed
/// ones can be dropped by the store instead of failing the whole frame.
#[derive(Debug)]
enum Inbound {
    Notification(Value),
    Server(ServerMessage),
}

fn decode_frame(text: &str) -> Option<Inbound> {
    let mut value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring non-JSON frame");
            return None;
        }
    };
    let event = value.get("event").and_then(Value::as_str).unwrap_or_default().to_owned();
    if event == "notification" || event == "new_notification" {
        return Some(Inbound::Notification(
            value.get_mut("data").map(Value::take).unwrap_or(Value::Null),
        ));
    }
    match serde_json::from_value::<ServerMessage>(value) {
        Ok(msg) => Some(Inbound::Server(msg)),
        Err(e) => {
            tracing::debug!(event = %event, error = %e, "Ignoring unrecognised frame");
            None
        }
    }
}

/// Exponential backoff with equal jitter: the delay lies in `[d/2, d]`
/// where `d = initial * 2^(attempt-1)`, capped at `max`.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let base = initial.saturating_mul(1u32 << exp).min(max);
    let half = base / 2;
    let jitter_ms = rand::rng().random_range(0..=half.as_millis() as u64);
    half + Duration::from_millis(jitter_ms)
}

/// Open a socket and complete the handshake within `handshake_timeout`.
async fn handshake(
    config: &ClientConfig,
    identity: &Identity,
) -> Result<(Socket, String, Vec<Inbound>), ClientError> {
    timeout(config.handshake_timeout, open_session(config, identity))
        .await
        .map_err(|_| ClientError::HandshakeTimeout)?
}

/// Frames that arrive before `connected` are returned so they can be
/// delivered afterwards.
async fn open_session(
    config: &ClientConfig,
    identity: &Identity,
) -> Result<(Socket, String, Vec<Inbound>), ClientError> {
    let (mut socket, _) = connect_async(config.endpoint()).await?;
    let mut early = Vec::new();

    let connection_id = loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => match decode_frame(text.as_str()) {
                Some(Inbound::Server(ServerMessage::Connected { connection_id, .. })) => {
                    break connection_id;
                }
                Some(inbound) => early.push(inbound),
                None => {}
            },
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = close_details(frame);
                if is_identity_fault(code) {
                    return Err(ClientError::Identity { code, reason });
                }
                return Err(ClientError::Transport(format!(
                    "closed during handshake ({})",
                    code
                )));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(ClientError::Transport(
                    "stream ended during handshake".to_string(),
                ))
            }
        }
    };

    send_frame(
        &mut socket,
        &ClientMessage::UserConnected {
            user_id: identity.user_id.clone(),
            role: identity.role,
        },
    )
    .await?;
    Ok((socket, connection_id, early))
}

fn close_details(frame: Option<CloseFrame>) -> (u16, String) {
    frame
        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
        .unwrap_or((1005, String::new()))
}

async fn send_frame(socket: &mut Socket, msg: &ClientMessage) -> Result<(), ClientError> {
    let json = serde_json::to_string(msg).map_err(|e| ClientError::Transport(e.to_string()))?;
    socket.send(Message::Text(json.into())).await?;
    Ok(())
}

enum Command {
    Send(ClientMessage),
    Subscribe(Room),
    Unsubscribe(Room),
    Accept {
        request: RideAcceptRequest,
        reply: AckReply,
    },
    Shutdown,
}

/// Why a live session ended.
enum SessionEnd {
    Shutdown,
    Lost,
    Rejected { code: u16, reason: String },
}

struct Supervisor {
    config: ClientConfig,
    identity: Identity,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    sinks: EventSinks,
    /// Ride rooms to rejoin after a reconnect.
    intents: HashSet<Room>,
    pending: HashMap<String, AckReply>,
}

impl Supervisor {
    async fn run(mut self, mut socket: Socket, early: Vec<Inbound>) {
        for inbound in early {
            self.deliver(inbound);
        }

        loop {
            let end = self.serve(&mut socket).await;
            self.fail_pending();

            match end {
                SessionEnd::Shutdown => {
                    let _ = self.sinks.lifecycle.send(LifecycleEvent::Disconnected);
                    break;
                }
                SessionEnd::Rejected { code, reason } => {
                    tracing::warn!(code, reason = %reason, "Server rejected identity");
                    let _ = self
                        .sinks
                        .lifecycle
                        .send(LifecycleEvent::AuthRejected { code, reason });
                    break;
                }
                SessionEnd::Lost => match self.reconnect().await {
                    Some(next) => socket = next,
                    None => break,
                },
            }
        }
    }

    async fn serve(&mut self, socket: &mut Socket) -> SessionEnd {
        loop {
            tokio::select! {
                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(inbound) = decode_frame(text.as_str()) {
                            self.deliver(inbound);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = close_details(frame);
                        if is_identity_fault(code) {
                            return SessionEnd::Rejected { code, reason };
                        }
                        tracing::info!(code, "Server closed the connection");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Socket error");
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => {
                        let _ = socket.close(None).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(cmd) => {
                        if let Err(e) = self.execute(socket, cmd).await {
                            tracing::warn!(error = %e, "Failed to send frame");
                            return SessionEnd::Lost;
                        }
                    }
                },
            }
        }
    }

    async fn execute(&mut self, socket: &mut Socket, cmd: Command) -> Result<(), ClientError> {
        match cmd {
            Command::Send(msg) => send_frame(socket, &msg).await,
            Command::Subscribe(room) => {
                let msg = ClientMessage::JoinRoom {
                    room: room.to_string(),
                };
                self.intents.insert(room);
                send_frame(socket, &msg).await
            }
            Command::Unsubscribe(room) => {
                self.intents.remove(&room);
                send_frame(
                    socket,
                    &ClientMessage::LeaveRoom {
                        room: room.to_string(),
                    },
                )
                .await
            }
            Command::Accept { request, reply } => {
                let msg = ClientMessage::RideAccepted(request.clone());
                self.pending.insert(request.request_id, reply);
                send_frame(socket, &msg).await
            }
            Command::Shutdown => Ok(()),
        }
    }

    fn deliver(&mut self, inbound: Inbound) {
        let msg = match inbound {
            Inbound::Notification(value) => {
                let _ = self.sinks.notifications.send(value);
                return;
            }
            Inbound::Server(msg) => msg,
        };

        match msg {
            ServerMessage::Connected { connection_id, .. } => {
                tracing::debug!(connection_id = %connection_id, "Duplicate handshake ack");
            }
            ServerMessage::RoomJoined { room } => {
                if let Ok(room @ Room::Ride(_)) = room.parse::<Room>() {
                    self.intents.insert(room);
                }
            }
            ServerMessage::RoomLeft { room } => {
                if let Ok(room) = room.parse::<Room>() {
                    self.intents.remove(&room);
                }
            }
            ServerMessage::NewRideRequest(request) => {
                let _ = self.sinks.rides.send(RideEvent::NewRequest(request));
            }
            ServerMessage::RideStatusChanged(change) => {
                let _ = self.sinks.rides.send(RideEvent::StatusChanged(change));
            }
            ServerMessage::RideAcceptedAck(ack) => match self.pending.remove(&ack.request_id) {
                Some(reply) => {
                    let _ = reply.send(Ok(ack));
                }
                None => tracing::debug!(request_id = %ack.request_id, "Unmatched accept ack"),
            },
            ServerMessage::DriverAvailabilityUpdate(update) => {
                let _ = self
                    .sinks
                    .presence
                    .send(PresenceEvent::DriverAvailability(update));
            }
            ServerMessage::ActiveUsersUpdate(count) => {
                let _ = self.sinks.presence.send(PresenceEvent::ActiveUsers(count));
            }
            ServerMessage::Notification(n) => match serde_json::to_value(n) {
                Ok(value) => {
                    let _ = self.sinks.notifications.send(value);
                }
                Err(e) => tracing::debug!(error = %e, "Failed to re-encode notification"),
            },
            ServerMessage::Error { code, message } => {
                tracing::warn!(code, message = %message, "Server reported an error");
            }
        }
    }

    fn fail_pending(&mut self) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(ClientError::ConnectionLost));
        }
    }

    /// Returns false when the owner asked to stop.
    fn handle_offline(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            Some(Command::Shutdown) | None => false,
            Some(Command::Send(msg)) => {
                tracing::debug!(?msg, "Dropping frame while reconnecting");
                true
            }
            Some(Command::Subscribe(room)) => {
                self.intents.insert(room);
                true
            }
            Some(Command::Unsubscribe(room)) => {
                self.intents.remove(&room);
                true
            }
            Some(Command::Accept { reply, .. }) => {
                let _ = reply.send(Err(ClientError::ConnectionLost));
                true
            }
        }
    }

    async fn reconnect(&mut self) -> Option<Socket> {
        let mut attempt: u32 = 0;
        loop {
            if self.config.max_attempts.is_some_and(|max| attempt >= max) {
                tracing::warn!(attempts = attempt, "Giving up on reconnecting");
                let _ = self
                    .sinks
                    .lifecycle
                    .send(LifecycleEvent::GaveUp { attempts: attempt });
                return None;
            }
            attempt += 1;

            let delay = backoff_delay(attempt, self.config.initial_backoff, self.config.max_backoff);
            let _ = self
                .sinks
                .lifecycle
                .send(LifecycleEvent::Reconnecting { attempt, delay });
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            let wait = sleep(delay);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    cmd = self.cmd_rx.recv() => {
                        if !self.handle_offline(cmd) {
                            let _ = self.sinks.lifecycle.send(LifecycleEvent::Disconnected);
                            return None;
                        }
                    }
                }
            }

            match handshake(&self.config, &self.identity).await {
                Ok((mut socket, connection_id, early)) => {
                    let rooms: Vec<Room> = self.intents.iter().cloned().collect();
                    let mut rejoined = true;
                    for room in rooms {
                        let msg = ClientMessage::JoinRoom {
                            room: room.to_string(),
                        };
                        if let Err(e) = send_frame(&mut socket, &msg).await {
                            tracing::warn!(error = %e, "Failed to rejoin room");
                            rejoined = false;
                            break;
                        }
                    }
                    if !rejoined {
                        continue;
                    }

                    for inbound in early {
                        self.deliver(inbound);
                    }
                    tracing::info!(connection_id = %connection_id, attempt, "Reconnected");
                    let _ = self
                        .sinks
                        .lifecycle
                        .send(LifecycleEvent::Reconnected { connection_id });
                    return Some(socket);
                }
                Err(ClientError::Identity { code, reason }) => {
                    let _ = self
                        .sinks
                        .lifecycle
                        .send(LifecycleEvent::AuthRejected { code, reason });
                    return None;
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }
    }
}

/// Handle to a supervised socket connection.
///
/// Dropping the handle stops the supervisor as well; [`disconnect`](Self::disconnect)
/// additionally waits for it to finish.
pub struct ConnectionManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
    connection_id: String,
    identity: Identity,
    ack_timeout: Duration,
}

impl ConnectionManager {
    /// Connect and complete the handshake. Identity faults come back as
    /// [`ClientError::Identity`] and should not be retried.
    pub async fn connect(
        config: ClientConfig,
        identity: Identity,
    ) -> Result<(Self, ClientEvents), ClientError> {
        let (socket, connection_id, early) = handshake(&config, &identity).await?;
        let (sinks, events) = event_channels();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let _ = sinks.lifecycle.send(LifecycleEvent::Connected {
            connection_id: connection_id.clone(),
        });
        tracing::info!(
            user_id = %identity.user_id,
            connection_id = %connection_id,
            "Socket connected"
        );

        let ack_timeout = config.ack_timeout;
        let supervisor = Supervisor {
            config,
            identity: identity.clone(),
            cmd_rx,
            sinks,
            intents: HashSet::new(),
            pending: HashMap::new(),
        };
        let closed_flag = closed.clone();
        let handle = tokio::spawn(async move {
            supervisor.run(socket, early).await;
            closed_flag.store(true, Ordering::SeqCst);
        });

        Ok((
            Self {
                cmd_tx,
                closed,
                supervisor: Some(handle),
                connection_id,
                identity,
                ack_timeout,
            },
            events,
        ))
    }

    /// Connection id from the first handshake.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn command(&self, cmd: Command) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.cmd_tx.send(cmd).map_err(|_| ClientError::Closed)
    }

    /// Join a ride room and keep it joined across reconnects.
    pub fn subscribe(&self, room: &Room) -> Result<(), ClientError> {
        match room {
            Room::Ride(_) => self.command(Command::Subscribe(room.clone())),
            other => Err(ClientError::InvalidRoom(other.to_string())),
        }
    }

    pub fn unsubscribe(&self, room: &Room) -> Result<(), ClientError> {
        self.command(Command::Unsubscribe(room.clone()))
    }

    pub fn view_ride(&self, ride_id: &str) -> Result<(), ClientError> {
        self.command(Command::Send(ClientMessage::ViewRide {
            ride_id: ride_id.to_string(),
        }))
    }

    pub fn set_availability(&self, available: bool) -> Result<(), ClientError> {
        self.command(Command::Send(ClientMessage::DriverAvailability { available }))
    }

    pub fn request_presence_resync(&self) -> Result<(), ClientError> {
        self.command(Command::Send(ClientMessage::PresenceResync))
    }

    /// Send an accept attempt and wait for its ack.
    ///
    /// [`ClientError::ConnectionLost`] means the outcome is unknown here; the
    /// server still resolves the attempt and the next snapshot shows it.
    pub async fn accept_ride(
        &self,
        request: RideAcceptRequest,
    ) -> Result<RideAcceptAck, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Accept { request, reply })?;
        match timeout(self.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Close the socket and wait until the supervisor has stopped.
    pub async fn disconnect(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(handle) = self.supervisor.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Connection supervisor panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_within_bounds() {
        let initial = Duration::from_millis(500);
        let max = Duration::from_secs(30);
        for attempt in 1..=20 {
            let expected = initial.saturating_mul(1u32 << (attempt - 1).min(31)).min(max);
            let delay = backoff_delay(attempt, initial, max);
            assert!(delay >= expected / 2, "attempt {} too short: {:?}", attempt, delay);
            assert!(delay <= expected, "attempt {} too long: {:?}", attempt, delay);
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let delay = backoff_delay(40, Duration::from_millis(500), Duration::from_secs(5));
        assert!(delay <= Duration::from_secs(5));
    }

    #[test]
    fn test_decode_keeps_notification_payload_raw() {
        let frame = r#"{"event":"new_notification","data":{"title":"no id"}}"#;
        match decode_frame(frame) {
            Some(Inbound::Notification(value)) => assert_eq!(value["title"], "no id"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_typed_frames() {
        let frame = r#"{"event":"room_joined","data":{"room":"ride:R1"}}"#;
        assert!(matches!(
            decode_frame(frame),
            Some(Inbound::Server(ServerMessage::RoomJoined { .. }))
        ));
        assert!(decode_frame(r#"{"event":"mystery","data":{}}"#).is_none());
        assert!(decode_frame("not json").is_none());
    }

    #[test]
    fn test_endpoint_appends_token() {
        let config = ClientConfig::new("ws://localhost:4000/ws", "abc");
        assert_eq!(config.endpoint(), "ws://localhost:4000/ws?token=abc");
    }

    #[test]
    fn test_identity_close_codes() {
        assert!(is_identity_fault(4001));
        assert!(is_identity_fault(4003));
        assert!(!is_identity_fault(1000));
        assert!(!ClientError::Identity {
            code: 4002,
            reason: String::new()
        }
        .is_transient());
        assert!(ClientError::ConnectionLost.is_transient());
    }
}
