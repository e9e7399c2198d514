//! WebSocket authority server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── SessionRoom (session_id) ── Session ── BroadcastGroup
//! Client B ──┘          │                                    │
//!                       │  submit / undo / redo               │
//!                       ▼                                    ▼
//!                 ack, rejected                  update, history_update,
//!                 (to the submitter)             cursor_update, user_joined,
//!                                                user_left (to the room)
//! ```
//!
//! Each session's state changes happen under its room lock and are
//! broadcast before the lock is released, so every connection sees updates
//! in revision order. A connection whose receiver falls behind the ring is
//! sent a fresh snapshot instead. A connection answers in the wire format of
//! the first data frame it received.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use scribe_core::{ClientId, SubmitOutcome};

use crate::broadcast::Outbound;
use crate::presence::CursorThrottle;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, WireFormat};
use crate::room::{RoomManager, SessionRoom};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_participants_per_session: usize,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
    /// Minimum spacing of cursor broadcasts per participant
    pub cursor_interval_ms: u64,
    /// Upper bound accepted by `set_delay`
    pub max_delay_ms: u64,
    /// Recent batch ids remembered per session for duplicate detection
    pub dedup_window: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_participants_per_session: 100,
            broadcast_capacity: 256,
            cursor_interval_ms: 100,
            max_delay_ms: 10_000,
            dedup_window: 256,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `SCRIBE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("SCRIBE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        overlay(&lookup, "SCRIBE_MAX_PARTICIPANTS", &mut config.max_participants_per_session);
        overlay(&lookup, "SCRIBE_BROADCAST_CAPACITY", &mut config.broadcast_capacity);
        overlay(&lookup, "SCRIBE_CURSOR_INTERVAL_MS", &mut config.cursor_interval_ms);
        overlay(&lookup, "SCRIBE_MAX_DELAY_MS", &mut config.max_delay_ms);
        config
    }
}

fn overlay<T: std::str::FromStr + std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else { return };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => log::warn!("Ignoring {key}={raw:?}: not a valid value, keeping {slot}"),
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_messages: u64,
}

struct Shared {
    config: ServerConfig,
    rooms: RoomManager,
    stats: RwLock<ServerStats>,
}

/// The authority.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity, config.dedup_window);
        Self {
            shared: Arc::new(Shared {
                config,
                rooms,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.rooms.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.shared.rooms
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type RoomReceiver = broadcast::Receiver<Arc<Outbound>>;

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), ProtocolError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut conn = Connection::new(addr, &shared.config);
    log::info!("WebSocket connection from {addr} assigned {}", conn.client_id);

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut broadcast_rx: Option<RoomReceiver> = None;

    let result = loop {
        let cursor_deadline = conn.cursor.deadline();
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break Ok(());
                    }
                    Some(Ok(frame)) => {
                        let Some((parsed, format)) = WireFormat::parse::<ClientMessage>(&frame) else {
                            continue;
                        };
                        conn.adopt_format(format);
                        {
                            let mut s = shared.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += frame.len() as u64;
                        }
                        let handled = match parsed {
                            Ok(message) => {
                                conn.handle(message, &shared, &mut ws_sender, &mut broadcast_rx).await
                            }
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                let revision = conn.revision();
                                conn.reject(&shared, &mut ws_sender, None, e, revision).await
                            }
                        };
                        if let Err(e) = handled {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break Ok(());
                    }
                }
            }

            out = async {
                match broadcast_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match out {
                    Ok(out) => {
                        if let Err(e) = conn.forward(&mut ws_sender, &out).await {
                            break Err(e);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        if let Err(e) = conn.resync(&mut ws_sender, &mut broadcast_rx, n).await {
                            break Err(e);
                        }
                    }
                    Err(RecvError::Closed) => break Ok(()),
                }
            }

            _ = async {
                match cursor_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending().await,
                }
            } => {
                conn.flush_cursor(Instant::now());
            }
        }
    };

    conn.leave(&shared).await;
    {
        let mut s = shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = shared.rooms.room_count().await;
    }
    result
}

/// Per-connection state.
struct Connection {
    addr: SocketAddr,
    client_id: ClientId,
    format: WireFormat,
    format_fixed: bool,
    room: Option<Arc<SessionRoom>>,
    cursor: CursorThrottle<ServerMessage>,
}

impl Connection {
    fn new(addr: SocketAddr, config: &ServerConfig) -> Self {
        Self {
            addr,
            client_id: ClientId::new(),
            format: WireFormat::Binary,
            format_fixed: false,
            room: None,
            cursor: CursorThrottle::new(Duration::from_millis(config.cursor_interval_ms)),
        }
    }

    fn adopt_format(&mut self, format: WireFormat) {
        if !self.format_fixed {
            log::debug!("{} speaks {:?}", self.addr, format);
            self.format = format;
            self.format_fixed = true;
        }
    }

    fn revision(&self) -> u64 {
        self.room.as_ref().map_or(0, |room| room.session().revision())
    }

    async fn send(&self, sink: &mut WsSink, message: &ServerMessage) -> Result<(), ProtocolError> {
        sink.send(self.format.frame(message)?).await?;
        Ok(())
    }

    async fn forward(&self, sink: &mut WsSink, out: &Outbound) -> Result<(), ProtocolError> {
        if !out.is_for(self.client_id) {
            return Ok(());
        }
        self.send(sink, &out.message).await
    }

    /// Forward every broadcast already queued for this connection, so a
    /// direct reply never overtakes an earlier revision.
    async fn drain(&self, sink: &mut WsSink, rx: &mut Option<RoomReceiver>) -> Result<(), ProtocolError> {
        loop {
            let Some(receiver) = rx.as_mut() else {
                return Ok(());
            };
            match receiver.try_recv() {
                Ok(out) => self.forward(sink, &out).await?,
                Err(TryRecvError::Lagged(n)) => return self.resync(sink, rx, n).await,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Recover a receiver that fell behind the broadcast ring.
    ///
    /// The skipped messages are gone, so the connection gets a fresh
    /// receiver and a fresh snapshot, both taken under the session lock.
    async fn resync(
        &self,
        sink: &mut WsSink,
        rx: &mut Option<RoomReceiver>,
        skipped: u64,
    ) -> Result<(), ProtocolError> {
        let Some(room) = &self.room else {
            return Ok(());
        };
        log::warn!(
            "Client {} lagged by {skipped} messages, sending a fresh snapshot",
            self.client_id
        );
        room.broadcast().record_lag(skipped);
        let (init, receiver) = {
            let session = room.session();
            let init = ServerMessage::Init {
                client_id: self.client_id,
                revision: session.revision(),
                text: session.text().to_string(),
                participants: session.participants(),
            };
            (init, room.broadcast().subscribe())
        };
        *rx = Some(receiver);
        self.send(sink, &init).await
    }

    async fn reject(
        &self,
        shared: &Shared,
        sink: &mut WsSink,
        batch_id: Option<uuid::Uuid>,
        reason: impl ToString,
        revision: u64,
    ) -> Result<(), ProtocolError> {
        shared.stats.write().await.rejected_messages += 1;
        self.send(sink, &ServerMessage::rejected(batch_id, reason, revision)).await
    }

    /// The joined room, if `session_id` addresses it.
    fn room_for(&self, session_id: &str) -> Result<Arc<SessionRoom>, ProtocolError> {
        let room = self.room.as_ref().ok_or(ProtocolError::NotJoined)?;
        if room.id() != session_id {
            return Err(ProtocolError::SessionMismatch {
                expected: room.id().to_string(),
                got: session_id.to_string(),
            });
        }
        Ok(room.clone())
    }

    async fn handle(
        &mut self,
        message: ClientMessage,
        shared: &Shared,
        sink: &mut WsSink,
        rx: &mut Option<RoomReceiver>,
    ) -> Result<(), ProtocolError> {
        if let ClientMessage::Ping = message {
            return self.send(sink, &ServerMessage::Pong).await;
        }
        if let ClientMessage::Join { session_id, username } = message {
            return self.join(session_id, username, shared, sink, rx).await;
        }

        let session_id = message.session_id().unwrap_or_default().to_string();
        let batch_id = match &message {
            ClientMessage::Edit { batch_id, .. } => Some(*batch_id),
            _ => None,
        };
        let room = match self.room_for(&session_id) {
            Ok(room) => room,
            Err(e) => {
                log::debug!("Refusing message from {}: {e}", self.client_id);
                let revision = self.revision();
                return self.reject(shared, sink, batch_id, e, revision).await;
            }
        };

        match message {
            ClientMessage::Edit { .. } => {
                let Some(batch) = message.into_batch() else {
                    return Ok(());
                };
                let batch_id = batch.batch_id;
                let delay = room.session().delay();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let reply = {
                    let mut session = room.session();
                    match session.submit(self.client_id, batch) {
                        Ok(SubmitOutcome::Applied(applied)) => {
                            let operations = applied.edits();
                            if !operations.is_empty() {
                                room.broadcast().broadcast(
                                    ServerMessage::Update {
                                        revision: applied.revision,
                                        operations: operations.clone(),
                                        origin: self.client_id,
                                    },
                                    Some(self.client_id),
                                );
                                room.broadcast().broadcast(
                                    ServerMessage::HistoryUpdate {
                                        entries: applied.entries,
                                    },
                                    None,
                                );
                            }
                            ServerMessage::Ack {
                                batch_id,
                                revision: applied.revision,
                                operations,
                                duplicate: false,
                            }
                        }
                        Ok(SubmitOutcome::Duplicate { revision, operations }) => ServerMessage::Ack {
                            batch_id,
                            revision,
                            operations,
                            duplicate: true,
                        },
                        Err(err) => {
                            log::warn!("Rejected batch {batch_id} from {}: {err}", self.client_id);
                            ServerMessage::rejected(Some(batch_id), err, session.revision())
                        }
                    }
                };
                if let ServerMessage::Rejected { .. } = reply {
                    shared.stats.write().await.rejected_messages += 1;
                }
                self.drain(sink, rx).await?;
                self.send(sink, &reply).await
            }

            ClientMessage::Cursor {
                position,
                selection_end,
                username,
                ..
            } => {
                let updated = room.session().update_cursor(&self.client_id, position, selection_end);
                match updated {
                    Ok(participant) => {
                        log::trace!(
                            "Cursor of {} in {:?} at {}..{}",
                            self.client_id,
                            room.id(),
                            participant.position,
                            participant.selection_end
                        );
                        let update = ServerMessage::CursorUpdate {
                            client_id: self.client_id,
                            position: participant.position,
                            selection_end: participant.selection_end,
                            username,
                        };
                        if let Some(update) = self.cursor.offer(update, Instant::now()) {
                            room.broadcast().broadcast(update, Some(self.client_id));
                        }
                    }
                    Err(err) => log::debug!("Dropping cursor from {}: {err}", self.client_id),
                }
                Ok(())
            }

            ClientMessage::RequestHistory { .. } => {
                self.drain(sink, rx).await?;
                let entries = room.session().history().to_vec();
                log::debug!("Sending {} history entries to {}", entries.len(), self.client_id);
                self.send(sink, &ServerMessage::History { entries }).await
            }

            ClientMessage::Undo { .. } | ClientMessage::Redo { .. } => {
                let undo = matches!(message, ClientMessage::Undo { .. });
                let failure = {
                    let mut session = room.session();
                    let result = if undo {
                        session.undo(self.client_id)
                    } else {
                        session.redo(self.client_id)
                    };
                    match result {
                        Ok(Some(applied)) => {
                            room.broadcast().broadcast(
                                ServerMessage::Update {
                                    revision: applied.revision,
                                    operations: applied.edits(),
                                    origin: self.client_id,
                                },
                                None,
                            );
                            room.broadcast().broadcast(
                                ServerMessage::HistoryUpdate {
                                    entries: applied.entries,
                                },
                                None,
                            );
                            None
                        }
                        Ok(None) => None,
                        Err(err) => Some((err, session.revision())),
                    }
                };
                match failure {
                    Some((err, revision)) => self.reject(shared, sink, None, err, revision).await,
                    None => Ok(()),
                }
            }

            ClientMessage::SetDelay { delay_ms, .. } => {
                let max = shared.config.max_delay_ms;
                if delay_ms > max {
                    let revision = self.revision();
                    let reason = format!("delay of {delay_ms} ms exceeds the maximum of {max} ms");
                    return self.reject(shared, sink, None, reason, revision).await;
                }
                room.session().set_delay(Duration::from_millis(delay_ms));
                Ok(())
            }

            ClientMessage::Join { .. } | ClientMessage::Ping => Ok(()),
        }
    }

    async fn join(
        &mut self,
        session_id: String,
        username: String,
        shared: &Shared,
        sink: &mut WsSink,
        rx: &mut Option<RoomReceiver>,
    ) -> Result<(), ProtocolError> {
        if self.room.as_ref().is_some_and(|room| room.id() != session_id) {
            self.leave(shared).await;
            *rx = None;
        }

        let client_id = self.client_id;
        let max = shared.config.max_participants_per_session;
        let joined = shared
            .rooms
            .enter(&session_id, |room| {
                let mut session = room.session();
                let rejoin = session.contains(&client_id);
                if !rejoin && session.participant_count() >= max {
                    return Err(session.revision());
                }
                let snapshot = session.join(client_id, username.as_str());
                // Subscribe under the lock: everything after the snapshot
                // reaches this receiver, nothing before it does.
                let receiver = room.broadcast().subscribe();
                if !rejoin {
                    room.broadcast().broadcast(
                        ServerMessage::UserJoined {
                            client_id,
                            participants: snapshot.participants.clone(),
                        },
                        Some(client_id),
                    );
                }
                Ok((room.clone(), snapshot, receiver))
            })
            .await;

        match joined {
            Ok((room, snapshot, receiver)) => {
                log::info!(
                    "{client_id} ({username}) joined {session_id:?} at revision {}",
                    snapshot.revision
                );
                self.room = Some(room);
                *rx = Some(receiver);
                shared.stats.write().await.active_rooms = shared.rooms.room_count().await;
                self.send(
                    sink,
                    &ServerMessage::Init {
                        client_id,
                        revision: snapshot.revision,
                        text: snapshot.text,
                        participants: snapshot.participants,
                    },
                )
                .await
            }
            Err(revision) => {
                log::warn!("Session {session_id:?} is full, refusing {client_id}");
                shared.rooms.remove_if_empty(&session_id).await;
                let reason = format!("session {session_id:?} is full ({max} participants)");
                self.reject(shared, sink, None, reason, revision).await
            }
        }
    }

    /// Flush a throttled cursor broadcast whose slot has arrived.
    fn flush_cursor(&mut self, now: Instant) {
        if let (Some(update), Some(room)) = (self.cursor.flush(now), &self.room) {
            room.broadcast().broadcast(update, Some(self.client_id));
        }
    }

    async fn leave(&mut self, shared: &Shared) {
        let Some(room) = self.room.take() else {
            return;
        };
        {
            let mut session = room.session();
            if session.leave(&self.client_id).is_some() {
                room.broadcast().broadcast(
                    ServerMessage::UserLeft {
                        client_id: self.client_id,
                        participants: session.participants(),
                    },
                    Some(self.client_id),
                );
            }
        }
        log::info!("{} left {:?}", self.client_id, room.id());
        shared.rooms.remove_if_empty(room.id()).await;
    }
}
