//! WebSocket client for one participant of one session.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with outbox re-send)
//! - Debounced local edits drained by a background ticker
//! - Remote application through [`scribe_core::Editor`]
//! - Throttled cursor presence and remote cursor tracking
//! - Paced history replay
//!
//! The editor state is shared between the caller and the reader task behind
//! a synchronous lock that is never held across an `.await`.

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use scribe_core::{
    AckOutcome, ClientId, Cursor, Edit, Editor, EditorConfig, HistoryEntry, JoinSnapshot,
    Participant, RemoteUpdate, SyncState, UpdateOutcome,
};

use crate::presence::{PresenceRoom, RemoteCursor};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, WireFormat};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub session_id: String,
    pub username: String,
    /// A headless client has no widget to echo programmatic changes, so
    /// echo suppression is off by default.
    pub editor: EditorConfig,
    pub cursor_interval_ms: u64,
    /// How often pending keystrokes and trailing cursor moves are checked.
    pub tick_interval_ms: u64,
    pub format: WireFormat,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        session_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            session_id: session_id.into(),
            username: username.into(),
            editor: EditorConfig {
                suppress_echo: false,
                ..EditorConfig::default()
            },
            cursor_interval_ms: 100,
            tick_interval_ms: 25,
            format: WireFormat::Binary,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("ws://127.0.0.1:9090", "default", "anonymous")
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// A fresh snapshot was adopted.
    Synchronized { revision: u64, text: String },
    /// Remote operations were applied to the mirror.
    RemoteEdit {
        revision: u64,
        edits: Vec<Edit>,
        cursor: Cursor,
    },
    Acknowledged { batch_id: Uuid, revision: u64 },
    Rejected {
        batch_id: Option<Uuid>,
        reason: String,
    },
    /// Revision agreement was lost; a new snapshot has been requested.
    Resynchronizing,
    CursorMoved {
        client_id: ClientId,
        position: usize,
        selection_end: usize,
    },
    ParticipantJoined {
        client_id: ClientId,
        participants: Vec<Participant>,
    },
    ParticipantLeft {
        client_id: ClientId,
        participants: Vec<Participant>,
    },
    HistoryReceived { entries: usize },
    ReplayFrame { index: usize, text: String },
    ReplayFinished { frames: usize },
    Pong,
}

const HISTORY_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner {
    config: ClientConfig,
    editor: Mutex<Editor>,
    presence: Mutex<PresenceRoom>,
    state: RwLock<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    resync_requested: AtomicBool,
    /// Wakes replays waiting for a requested ledger.
    history_ready: Notify,
}

impl Inner {
    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::debug!("Dropping client event: {e}");
        }
    }

    fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        let outgoing = self.outgoing.lock();
        let tx = outgoing.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(message).map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn join_message(&self) -> ClientMessage {
        ClientMessage::Join {
            session_id: self.config.session_id.clone(),
            username: self.config.username.clone(),
        }
    }

    /// Ask for a fresh snapshot, once per desynchronisation.
    fn resync(&self) {
        if self.resync_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!("Resynchronizing {:?}", self.config.session_id);
        if let Err(e) = self.send(self.join_message()) {
            log::warn!("Cannot request resync: {e}");
        }
        self.emit(SyncEvent::Resynchronizing);
    }

    fn applied(&self, revision: u64, edits: Vec<Edit>, cursor: Cursor, doc_len: usize) {
        self.presence.lock().shift_cursors(&edits, doc_len);
        self.emit(SyncEvent::RemoteEdit {
            revision,
            edits,
            cursor,
        });
    }

    /// Report outcomes of updates applied after a replay.
    fn settle(&self, outcomes: Vec<UpdateOutcome>) {
        let (revision, doc_len, desynced) = {
            let editor = self.editor.lock();
            (editor.revision(), editor.text().chars().count(), editor.needs_resync())
        };
        for outcome in outcomes {
            if let UpdateOutcome::Applied { cursor, edits } = outcome {
                self.applied(revision, edits, cursor, doc_len);
            }
        }
        if desynced {
            self.resync();
        }
    }

    fn send_batches(&self, batches: Vec<scribe_core::EditBatch>) -> usize {
        let mut sent = 0;
        for batch in batches {
            log::debug!(
                "Sending batch {} ({} op(s) on revision {})",
                batch.batch_id,
                batch.operations.len(),
                batch.base_revision
            );
            // Unsent batches stay in the outbox and go out after the next init.
            if self.send(ClientMessage::edit(batch)).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Init {
                client_id,
                revision,
                text,
                participants,
            } => {
                let (resend, text) = {
                    let mut editor = self.editor.lock();
                    let resend = editor.handle_init(JoinSnapshot {
                        client_id,
                        revision,
                        text,
                        participants: participants.clone(),
                    });
                    (resend, editor.text().to_string())
                };
                {
                    let mut presence = self.presence.lock();
                    presence.set_local_id(client_id);
                    presence.sync_roster(&participants);
                }
                self.resync_requested.store(false, Ordering::SeqCst);
                self.send_batches(resend);
                self.emit(SyncEvent::Synchronized { revision, text });
            }

            ServerMessage::Update {
                revision,
                operations,
                origin,
            } => {
                let (outcome, doc_len) = {
                    let mut editor = self.editor.lock();
                    let outcome = editor.handle_update(RemoteUpdate {
                        revision,
                        operations,
                        origin,
                    });
                    (outcome, editor.text().chars().count())
                };
                match outcome {
                    Ok(UpdateOutcome::Applied { cursor, edits }) => {
                        self.applied(revision, edits, cursor, doc_len)
                    }
                    Ok(UpdateOutcome::Desynced) => self.resync(),
                    Ok(other) => log::debug!("Update to revision {revision}: {other:?}"),
                    Err(e) => log::debug!("Update to revision {revision} ignored: {e}"),
                }
            }

            ServerMessage::Ack {
                batch_id,
                revision,
                operations,
                duplicate,
            } => {
                let (outcome, doc_len) = {
                    let mut editor = self.editor.lock();
                    let outcome = editor.handle_ack(batch_id, revision, operations, duplicate);
                    (outcome, editor.text().chars().count())
                };
                match outcome {
                    Ok(AckOutcome::Confirmed) => {
                        self.emit(SyncEvent::Acknowledged { batch_id, revision })
                    }
                    Ok(AckOutcome::Applied { cursor, edits }) => {
                        self.applied(revision, edits, cursor, doc_len);
                        self.emit(SyncEvent::Acknowledged { batch_id, revision });
                    }
                    Ok(AckOutcome::Desynced) => self.resync(),
                    Ok(other) => log::debug!("Ack for {batch_id}: {other:?}"),
                    Err(e) => log::debug!("Ack for {batch_id} ignored: {e}"),
                }
            }

            ServerMessage::Rejected {
                batch_id,
                reason,
                revision,
            } => {
                log::warn!("Authority rejected {batch_id:?} at revision {revision}: {reason}");
                let ours = batch_id.is_some_and(|id| self.editor.lock().handle_rejected(id));
                self.emit(SyncEvent::Rejected { batch_id, reason });
                if ours {
                    self.resync();
                }
            }

            ServerMessage::CursorUpdate {
                client_id,
                position,
                selection_end,
                username,
            } => {
                log::trace!("Cursor of {client_id} at {position}..{selection_end}");
                self.presence
                    .lock()
                    .handle_cursor_update(client_id, &username, position, selection_end);
                self.emit(SyncEvent::CursorMoved {
                    client_id,
                    position,
                    selection_end,
                });
            }

            ServerMessage::UserJoined {
                client_id,
                participants,
            } => {
                self.editor.lock().set_participants(participants.clone());
                self.presence.lock().sync_roster(&participants);
                self.emit(SyncEvent::ParticipantJoined {
                    client_id,
                    participants,
                });
            }

            ServerMessage::UserLeft {
                client_id,
                participants,
            } => {
                self.editor.lock().set_participants(participants.clone());
                {
                    let mut presence = self.presence.lock();
                    presence.remove(&client_id);
                    presence.sync_roster(&participants);
                }
                self.emit(SyncEvent::ParticipantLeft {
                    client_id,
                    participants,
                });
            }

            ServerMessage::History { entries } => {
                let count = entries.len();
                self.editor.lock().handle_history(entries);
                self.history_ready.notify_waiters();
                self.emit(SyncEvent::HistoryReceived { entries: count });
            }

            ServerMessage::HistoryUpdate { entries } => {
                self.editor.lock().handle_history_update(entries);
            }

            ServerMessage::Pong => self.emit(SyncEvent::Pong),
        }
    }

    fn tick(&self, now: Instant) -> Result<usize, ProtocolError> {
        let batches = self.editor.lock().poll(now)?;
        let sent = self.send_batches(batches);
        let trailing = self.presence.lock().flush_local_cursor(now);
        if let Some(cursor) = trailing {
            self.send_cursor(cursor)?;
        }
        Ok(sent)
    }

    fn send_cursor(&self, cursor: Cursor) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Cursor {
            session_id: self.config.session_id.clone(),
            position: cursor.position,
            selection_end: cursor.selection_end,
            username: self.config.username.clone(),
        })
    }

    fn flush_edits(&self) -> Result<usize, ProtocolError> {
        let batches = self.editor.lock().flush_now(Instant::now())?;
        Ok(self.send_batches(batches))
    }
}

/// Ends replay when the replay future finishes or is dropped.
struct ReplayGuard<'a> {
    inner: &'a Inner,
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        let outcomes = self.inner.editor.lock().end_replay();
        self.inner.settle(outcomes);
    }
}

pub struct SyncClient {
    inner: Arc<Inner>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let editor = Editor::new(config.session_id.clone(), config.editor);
        let presence = PresenceRoom::new(Duration::from_millis(config.cursor_interval_ms));
        Self {
            inner: Arc::new(Inner {
                config,
                editor: Mutex::new(editor),
                presence: Mutex::new(presence),
                state: RwLock::new(ConnectionState::Disconnected),
                outgoing: Mutex::new(None),
                event_tx,
                resync_requested: AtomicBool::new(false),
                history_ready: Notify::new(),
            }),
            event_rx: Some(event_rx),
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the session.
    ///
    /// Spawns the writer, reader and ticker tasks. Calling it again after a
    /// disconnect rejoins; unacknowledged batches are re-sent once the new
    /// snapshot arrives.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.stop_tasks();
        let reconnecting = self.inner.editor.lock().sync_state() != SyncState::Detached;
        *self.inner.state.write() = if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };

        let url = self.inner.config.server_url.clone();
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.inner.state.write() = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        *self.inner.outgoing.lock() = Some(out_tx);
        let format = self.inner.config.format;
        self.tasks.push(tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let frame = match format.frame(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("Cannot encode {message:?}: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_writer.send(frame).await {
                    log::error!("WebSocket send failed: {e}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        }));

        self.inner.resync_requested.store(false, Ordering::SeqCst);
        self.inner.send(self.inner.join_message())?;
        *self.inner.state.write() = ConnectionState::Connected;
        self.inner.emit(SyncEvent::Connected);
        log::info!(
            "Connected to {url} as {:?} in {:?}",
            self.inner.config.username,
            self.inner.config.session_id
        );

        // Reader task: process incoming WebSocket messages
        let inner = self.inner.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(frame) => match WireFormat::parse::<ServerMessage>(&frame) {
                        Some((Ok(message), _)) => inner.handle_server_message(message),
                        Some((Err(e), _)) => log::warn!("Undecodable server message: {e}"),
                        None if frame.is_close() => break,
                        None => {}
                    },
                    Err(e) => {
                        log::error!("WebSocket error: {e}");
                        break;
                    }
                }
            }
            *inner.state.write() = ConnectionState::Disconnected;
            inner.outgoing.lock().take();
            inner.emit(SyncEvent::Disconnected);
        }));

        // Ticker task: debounce flushes and trailing cursor moves
        let inner = self.inner.clone();
        let period = Duration::from_millis(self.inner.config.tick_interval_ms.max(1));
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if *inner.state.read() != ConnectionState::Connected {
                    break;
                }
                if let Err(e) = inner.tick(Instant::now()) {
                    log::warn!("Tick failed: {e}");
                }
            }
        }));

        Ok(())
    }

    /// Close the connection. Local state, including unacknowledged
    /// batches, is kept for a later [`connect`](Self::connect).
    pub async fn disconnect(&mut self) {
        // Dropping the sender lets the writer close the socket.
        self.inner.outgoing.lock().take();
        *self.inner.state.write() = ConnectionState::Disconnected;
        let tasks: Vec<JoinHandle<()>> = self.tasks.drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Replace the local text, as an input event from an editing surface.
    /// Returns `true` if it was taken as a user edit.
    pub fn input(&self, content: &str) -> bool {
        self.inner.editor.lock().on_input(content, Instant::now())
    }

    /// Move the local cursor and share it, subject to the cursor throttle.
    pub fn move_cursor(&self, position: usize, selection_end: usize) -> Result<Cursor, ProtocolError> {
        let cursor = self.inner.editor.lock().move_cursor(position, selection_end);
        let due = self
            .inner
            .presence
            .lock()
            .update_local_cursor(cursor, Instant::now());
        if let Some(cursor) = due {
            self.inner.send_cursor(cursor)?;
        }
        Ok(cursor)
    }

    /// Send due edit batches and trailing cursor moves. The background
    /// ticker calls this; hosts may call it directly. Returns the number of
    /// batches sent.
    pub fn tick(&self) -> Result<usize, ProtocolError> {
        self.inner.tick(Instant::now())
    }

    /// Send pending keystrokes now, ignoring the debounce window.
    pub fn flush(&self) -> Result<usize, ProtocolError> {
        self.inner.flush_edits()
    }

    pub fn request_history(&self) -> Result<(), ProtocolError> {
        self.inner.send(ClientMessage::RequestHistory {
            session_id: self.inner.config.session_id.clone(),
        })
    }

    pub fn undo(&self) -> Result<(), ProtocolError> {
        self.inner.flush_edits()?;
        self.inner.send(ClientMessage::Undo {
            session_id: self.inner.config.session_id.clone(),
        })
    }

    pub fn redo(&self) -> Result<(), ProtocolError> {
        self.inner.flush_edits()?;
        self.inner.send(ClientMessage::Redo {
            session_id: self.inner.config.session_id.clone(),
        })
    }

    /// Ask the authority to delay each edit of this session.
    pub fn set_delay(&self, delay: Duration) -> Result<(), ProtocolError> {
        self.inner.send(ClientMessage::SetDelay {
            session_id: self.inner.config.session_id.clone(),
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        })
    }

    pub fn ping(&self) -> Result<(), ProtocolError> {
        self.inner.send(ClientMessage::Ping)
    }

    /// Replay the session history, one frame per `pace`.
    ///
    /// The full ledger is requested first unless the client already holds
    /// one starting at revision 1. Input is ignored and remote updates are
    /// deferred until the replay finishes, fails, or this future is dropped.
    /// Returns the number of frames shown.
    pub async fn replay_history(&self, pace: Duration) -> Result<usize, ProtocolError> {
        if !self.inner.editor.lock().holds_full_history() {
            self.fetch_history().await?;
        }
        self.inner.editor.lock().begin_replay(Instant::now())?;
        let guard = ReplayGuard { inner: &self.inner };

        let mut frames = 0;
        loop {
            let next = self.inner.editor.lock().replay_next();
            match next {
                Some(Ok(frame)) => {
                    frames += 1;
                    self.inner.emit(SyncEvent::ReplayFrame {
                        index: frame.index,
                        text: frame.text,
                    });
                    tokio::time::sleep(pace).await;
                }
                Some(Err(e)) => {
                    drop(guard);
                    return Err(e.into());
                }
                None => break,
            }
        }
        drop(guard);
        self.inner.emit(SyncEvent::ReplayFinished { frames });
        Ok(frames)
    }

    /// Request the ledger and wait for the reply.
    async fn fetch_history(&self) -> Result<(), ProtocolError> {
        let arrived = self.inner.history_ready.notified();
        tokio::pin!(arrived);
        arrived.as_mut().enable();
        self.request_history()?;
        tokio::time::timeout(HISTORY_TIMEOUT, arrived)
            .await
            .map_err(|_| ProtocolError::Timeout)
    }

    pub fn text(&self) -> String {
        self.inner.editor.lock().text().to_string()
    }

    pub fn revision(&self) -> u64 {
        self.inner.editor.lock().revision()
    }

    pub fn cursor(&self) -> Cursor {
        self.inner.editor.lock().cursor()
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.inner.editor.lock().client_id()
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.editor.lock().sync_state()
    }

    pub fn unacknowledged(&self) -> usize {
        self.inner.editor.lock().unacknowledged()
    }

    pub fn is_replaying(&self) -> bool {
        self.inner.editor.lock().is_replaying()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner.editor.lock().participants().to_vec()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.editor.lock().history().to_vec()
    }

    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.inner.presence.lock().remote_cursors()
    }

    /// Forget remote cursors idle for longer than the presence timeout.
    pub fn prune_idle_cursors(&self) -> Vec<ClientId> {
        self.inner.presence.lock().cleanup_idle_peers()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
