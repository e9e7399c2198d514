//! Client-side editor state.
//!
//! [`Editor`] owns everything a participant keeps locally: the document
//! mirror, its cursor, the debounced local edit pipeline, the outbox of
//! unacknowledged batches, the input gate and the last ledger received for
//! replay. It never performs I/O. The network client feeds it server
//! messages and drains the batches it wants sent.

use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

use crate::apply::{apply_remote, Cursor};
use crate::document::TextDocument;
use crate::history::HistoryEntry;
use crate::mode::{InputGate, InputMode};
use crate::operation::{ClientId, Edit, OperationError};
use crate::outbox::{EditBatch, Outbox};
use crate::pipeline::{LocalEditPipeline, PipelineConfig};
use crate::presence::Participant;
use crate::replay::{Replay, ReplayFrame};
use crate::session::JoinSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditorConfig {
    pub pipeline: PipelineConfig,
    /// Maximum number of unacknowledged batches.
    pub outbox_capacity: usize,
    /// Swallow the input event a host fires for a programmatic change.
    pub suppress_echo: bool,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            outbox_capacity: 10_000,
            suppress_echo: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditorError {
    #[error("no initial snapshot received")]
    NotInitialized,
    #[error("replay already in progress")]
    ReplayInProgress,
    #[error("no history to replay")]
    NoHistory,
    #[error("held history does not start at revision 1")]
    IncompleteHistory,
    #[error("outbox is full")]
    OutboxFull,
    #[error(transparent)]
    Operation(#[from] OperationError),
}

/// Whether the mirror is known to agree with the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No snapshot received yet.
    Detached,
    Synced,
    /// Revision agreement was lost; a fresh snapshot is required.
    Desynced,
}

/// Operations broadcast by the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUpdate {
    /// Revision after the last operation.
    pub revision: u64,
    pub operations: Vec<Edit>,
    pub origin: ClientId,
}

impl RemoteUpdate {
    /// Revision the operations were applied on top of.
    pub fn base_revision(&self) -> Option<u64> {
        self.revision.checked_sub(self.operations.len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied { cursor: Cursor, edits: Vec<Edit> },
    /// Queued until replay ends.
    Deferred,
    /// Already reflected in the mirror.
    Duplicate,
    Desynced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The batch was already reflected locally.
    Confirmed,
    /// A re-sent batch whose applied operations were merged into the mirror.
    Applied { cursor: Cursor, edits: Vec<Edit> },
    Deferred,
    Desynced,
    /// No such batch in the outbox.
    Unknown,
}

#[derive(Debug)]
pub struct Editor {
    session_id: String,
    client_id: Option<ClientId>,
    state: SyncState,
    document: TextDocument,
    cursor: Cursor,
    pipeline: LocalEditPipeline,
    gate: InputGate,
    outbox: Outbox,
    /// Flushed batches not yet handed to the transport.
    ready: VecDeque<EditBatch>,
    participants: Vec<Participant>,
    history: Vec<HistoryEntry>,
    deferred: VecDeque<RemoteUpdate>,
    /// Outcomes of deferred updates applied when replay ended by itself.
    settled: Vec<UpdateOutcome>,
    replay: Option<Replay>,
}

impl Editor {
    pub fn new(session_id: impl Into<String>, config: EditorConfig) -> Self {
        Self {
            session_id: session_id.into(),
            client_id: None,
            state: SyncState::Detached,
            document: TextDocument::new(),
            cursor: Cursor::default(),
            pipeline: LocalEditPipeline::new(config.pipeline),
            gate: InputGate::new(config.suppress_echo),
            outbox: Outbox::new(config.outbox_capacity),
            ready: VecDeque::new(),
            participants: Vec::new(),
            history: Vec::new(),
            deferred: VecDeque::new(),
            settled: Vec::new(),
            replay: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn sync_state(&self) -> SyncState {
        self.state
    }

    pub fn needs_resync(&self) -> bool {
        self.state == SyncState::Desynced
    }

    pub fn text(&self) -> &str {
        self.document.as_str()
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Local revision, including optimistic local edits.
    pub fn revision(&self) -> u64 {
        self.pipeline.revision()
    }

    pub fn mode(&self) -> InputMode {
        self.gate.mode()
    }

    pub fn is_replaying(&self) -> bool {
        self.gate.is_replaying()
    }

    pub fn unacknowledged(&self) -> usize {
        self.outbox.len()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn set_participants(&mut self, participants: Vec<Participant>) {
        self.participants = participants;
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Adopt a fresh snapshot from the authority.
    ///
    /// Returns every unacknowledged batch, oldest first, to be re-sent.
    pub fn handle_init(&mut self, snapshot: JoinSnapshot) -> Vec<EditBatch> {
        if self.gate.is_replaying() {
            self.replay = None;
            self.gate.end_replay();
        }
        self.deferred.clear();
        self.settled.clear();

        // Keystrokes typed since the last flush must survive the reset.
        if let Err(err) = self.flush_pending(Instant::now(), true) {
            warn!("dropping unsent keystrokes on resync: {}", err);
        }

        {
            let _guard = self.gate.applying_remote();
            self.document.replace(snapshot.text.clone());
        }
        self.cursor = self.cursor.clamp(self.document.len());
        self.pipeline.reset(snapshot.text, snapshot.revision);
        self.client_id = Some(snapshot.client_id);
        self.participants = snapshot.participants;
        // A ledger that stops short of the snapshot can no longer be continued.
        if self.history.last().map(|entry| entry.applied_revision) != Some(snapshot.revision) {
            self.history.clear();
        }
        self.state = SyncState::Synced;

        self.ready.clear();
        let resend = self.outbox.resubmit();
        info!(
            "synchronized at revision {} as {} ({} batch(es) to re-send)",
            snapshot.revision,
            snapshot.client_id,
            resend.len()
        );
        resend
    }

    /// Feed a content-changing input event. Returns `true` if it was taken
    /// as a user edit.
    pub fn on_input(&mut self, content: &str, now: Instant) -> bool {
        if !self.gate.accepts_input() {
            trace!("input ignored in {:?} mode", self.gate.mode());
            return false;
        }
        if content == self.document.as_str() {
            return false;
        }
        self.document.replace(content);
        self.cursor = self.cursor.clamp(self.document.len());
        self.pipeline.record(now);
        true
    }

    /// Move the local cursor. Returns the clamped value.
    pub fn move_cursor(&mut self, position: usize, selection_end: usize) -> Cursor {
        self.cursor = Cursor::with_selection(position, selection_end).clamp(self.document.len());
        self.cursor
    }

    /// Flush the pending burst if it is due and return batches to send.
    pub fn poll(&mut self, now: Instant) -> Result<Vec<EditBatch>, EditorError> {
        self.flush_pending(now, false)?;
        Ok(self.ready.drain(..).collect())
    }

    /// Flush the pending burst regardless of the debounce window.
    pub fn flush_now(&mut self, now: Instant) -> Result<Vec<EditBatch>, EditorError> {
        self.flush_pending(now, true)?;
        Ok(self.ready.drain(..).collect())
    }

    pub fn handle_update(&mut self, update: RemoteUpdate) -> Result<UpdateOutcome, EditorError> {
        if self.state != SyncState::Synced {
            return Err(EditorError::NotInitialized);
        }
        if !self.gate.accepts_remote() {
            debug!("deferring update to revision {} during replay", update.revision);
            self.deferred.push_back(update);
            return Ok(UpdateOutcome::Deferred);
        }
        Ok(self.absorb(update))
    }

    pub fn handle_ack(
        &mut self,
        batch_id: Uuid,
        revision: u64,
        operations: Vec<Edit>,
        duplicate: bool,
    ) -> Result<AckOutcome, EditorError> {
        let Some(inflight) = self.outbox.ack(batch_id) else {
            debug!("ack for unknown batch {}", batch_id);
            return Ok(AckOutcome::Unknown);
        };
        if self.state != SyncState::Synced {
            return Ok(AckOutcome::Confirmed);
        }

        if inflight.applied_locally {
            if duplicate || revision == inflight.expected_revision {
                return Ok(AckOutcome::Confirmed);
            }
            warn!(
                "batch {} acknowledged at revision {}, expected {}",
                batch_id, revision, inflight.expected_revision
            );
            self.desync();
            return Ok(AckOutcome::Desynced);
        }

        if duplicate || operations.is_empty() {
            return Ok(AckOutcome::Confirmed);
        }
        let update = RemoteUpdate {
            revision,
            operations,
            origin: self.client_id.unwrap_or_else(ClientId::nil),
        };
        if !self.gate.accepts_remote() {
            self.deferred.push_back(update);
            return Ok(AckOutcome::Deferred);
        }
        Ok(match self.absorb(update) {
            UpdateOutcome::Applied { cursor, edits } => AckOutcome::Applied { cursor, edits },
            UpdateOutcome::Duplicate => AckOutcome::Confirmed,
            UpdateOutcome::Deferred => AckOutcome::Deferred,
            UpdateOutcome::Desynced => AckOutcome::Desynced,
        })
    }

    pub fn handle_history(&mut self, entries: Vec<HistoryEntry>) {
        self.history = entries;
    }

    /// Append ledger entries that continue the held ledger.
    ///
    /// Entries already held are skipped. When the update leaves a gap (for
    /// instance a participant that joined mid-session and never asked for
    /// the full ledger) the rest is dropped, so the held ledger always
    /// starts at revision 1 without holes.
    pub fn handle_history_update(&mut self, entries: Vec<HistoryEntry>) {
        let mut next = self.history.last().map_or(1, |entry| entry.applied_revision + 1);
        for entry in entries {
            if entry.applied_revision < next {
                continue;
            }
            if entry.applied_revision > next {
                debug!(
                    "history update at revision {} leaves a gap after {}, ignored",
                    entry.applied_revision,
                    next - 1
                );
                break;
            }
            self.history.push(entry);
            next += 1;
        }
    }

    /// Whether the held ledger rebuilds the document from empty.
    pub fn holds_full_history(&self) -> bool {
        self.history
            .first()
            .is_some_and(|entry| entry.applied_revision == 1)
    }

    /// The authority refused a batch. Returns `true` if it was ours, in
    /// which case the mirror holds edits the authority never applied and a
    /// resync is required.
    pub fn handle_rejected(&mut self, batch_id: Uuid) -> bool {
        if self.outbox.ack(batch_id).is_none() {
            return false;
        }
        warn!("batch {} rejected by the authority", batch_id);
        self.desync();
        true
    }

    /// Enter replay of the last received ledger. Returns the frame count.
    pub fn begin_replay(&mut self, now: Instant) -> Result<usize, EditorError> {
        if self.gate.is_replaying() {
            return Err(EditorError::ReplayInProgress);
        }
        if self.history.is_empty() {
            return Err(EditorError::NoHistory);
        }
        if !self.holds_full_history() {
            return Err(EditorError::IncompleteHistory);
        }
        self.flush_pending(now, true)?;
        if !self.gate.begin_replay() {
            return Err(EditorError::ReplayInProgress);
        }
        self.replay = Some(Replay::new(self.history.clone()));
        Ok(self.history.len())
    }

    /// Next replay frame. Replay ends by itself after the last frame or on
    /// error.
    pub fn replay_next(&mut self) -> Option<Result<ReplayFrame, EditorError>> {
        let replay = self.replay.as_mut()?;
        match replay.next_frame() {
            Some(Ok(frame)) => Some(Ok(frame)),
            Some(Err(err)) => {
                warn!("replay stopped: {}", err);
                let outcomes = self.end_replay();
                self.settled.extend(outcomes);
                Some(Err(err.into()))
            }
            None => {
                let outcomes = self.end_replay();
                self.settled.extend(outcomes);
                None
            }
        }
    }

    /// Leave replay and apply the updates that arrived meanwhile.
    ///
    /// When replay already ended after its last frame, returns the outcomes
    /// produced then, once.
    pub fn end_replay(&mut self) -> Vec<UpdateOutcome> {
        if !self.gate.is_replaying() {
            return std::mem::take(&mut self.settled);
        }
        self.replay = None;
        self.gate.end_replay();

        let deferred: Vec<RemoteUpdate> = self.deferred.drain(..).collect();
        if !deferred.is_empty() {
            debug!("applying {} update(s) deferred during replay", deferred.len());
        }
        deferred
            .into_iter()
            .map(|update| {
                if self.state == SyncState::Synced {
                    self.absorb(update)
                } else {
                    UpdateOutcome::Desynced
                }
            })
            .collect()
    }

    fn absorb(&mut self, update: RemoteUpdate) -> UpdateOutcome {
        if let Err(err) = self.flush_pending(Instant::now(), true) {
            warn!("cannot flush local edits before remote update: {}", err);
            self.desync();
            return UpdateOutcome::Desynced;
        }

        let local = self.pipeline.revision();
        match update.base_revision() {
            Some(base) if base == local => {
                match apply_remote(&mut self.gate, &mut self.document, &update.operations, self.cursor) {
                    Ok(applied) => {
                        self.cursor = applied.cursor;
                        self.pipeline.sync(self.document.as_str(), update.revision);
                        debug!(
                            "applied {} operation(s) from {}, revision {} -> {}",
                            update.operations.len(),
                            update.origin,
                            local,
                            update.revision
                        );
                        UpdateOutcome::Applied {
                            cursor: self.cursor,
                            edits: update.operations,
                        }
                    }
                    Err(err) => {
                        warn!("remote operations do not fit the mirror: {}", err);
                        self.desync();
                        UpdateOutcome::Desynced
                    }
                }
            }
            Some(_) if update.revision <= local && !self.outbox.has_local_unacked() => {
                debug!("ignoring duplicate update to revision {}", update.revision);
                UpdateOutcome::Duplicate
            }
            _ => {
                warn!(
                    "update to revision {} ({} operation(s)) does not follow local revision {}",
                    update.revision,
                    update.operations.len(),
                    local
                );
                self.desync();
                UpdateOutcome::Desynced
            }
        }
    }

    fn flush_pending(&mut self, now: Instant, force: bool) -> Result<(), EditorError> {
        if self.gate.is_replaying() || !self.pipeline.has_pending() {
            return Ok(());
        }
        if self.outbox.is_full() {
            return Err(EditorError::OutboxFull);
        }
        let Some(pending) = self.pipeline.flush(self.document.as_str(), now, force) else {
            return Ok(());
        };
        let batch = EditBatch {
            session_id: self.session_id.clone(),
            batch_id: Uuid::new_v4(),
            base_revision: pending.base_revision,
            operations: pending.edits,
        };
        self.outbox.push(batch.clone());
        self.ready.push_back(batch);
        Ok(())
    }

    fn desync(&mut self) {
        if self.state == SyncState::Synced {
            warn!("mirror lost revision agreement at {}; resync required", self.revision());
            self.state = SyncState::Desynced;
        }
    }
}
