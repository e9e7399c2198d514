//! Authoritative session state.
//!
//! A [`Session`] owns the document, the revision counter, the roster and
//! the ledger. It is a plain synchronous value; the network layer is
//! responsible for funnelling one session's messages through it one at a
//! time.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::document::TextDocument;
use crate::history::{HistoryEntry, HistoryLedger, LedgerAction};
use crate::operation::{validate_batch, ClientId, Edit, Operation, OperationError};
use crate::outbox::EditBatch;
use crate::presence::{Participant, Roster};
use crate::transform::rebase;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("submitted revision {submitted} is ahead of session revision {current}")]
    FutureRevision { submitted: u64, current: u64 },
    #[error("unknown participant {0}")]
    UnknownParticipant(ClientId),
    #[error(transparent)]
    Operation(#[from] OperationError),
}

/// What a joining participant needs to build its mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSnapshot {
    pub client_id: ClientId,
    pub revision: u64,
    pub text: String,
    pub participants: Vec<Participant>,
}

/// Operations the authority just applied, ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedBatch {
    pub origin: ClientId,
    pub base_revision: u64,
    /// Revision after the last operation.
    pub revision: u64,
    pub operations: Vec<Operation>,
    pub entries: Vec<HistoryEntry>,
}

impl AppliedBatch {
    pub fn edits(&self) -> Vec<Edit> {
        self.operations.iter().map(|op| op.edit.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Applied(AppliedBatch),
    /// The batch id was seen before; nothing was applied again.
    Duplicate { revision: u64, operations: Vec<Edit> },
}

#[derive(Debug, Clone)]
struct RecentBatch {
    batch_id: Uuid,
    revision: u64,
    operations: Vec<Edit>,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    document: TextDocument,
    roster: Roster,
    ledger: HistoryLedger,
    recent: VecDeque<RecentBatch>,
    dedup_window: usize,
    delay: Duration,
}

impl Session {
    pub fn new(id: impl Into<String>, dedup_window: usize) -> Self {
        Self {
            id: id.into(),
            document: TextDocument::new(),
            roster: Roster::new(),
            ledger: HistoryLedger::new(),
            recent: VecDeque::with_capacity(dedup_window.min(1024)),
            dedup_window,
            delay: Duration::ZERO,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Revision equals the number of operations ever applied.
    pub fn revision(&self) -> u64 {
        self.ledger.len() as u64
    }

    pub fn text(&self) -> &str {
        self.document.as_str()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.roster.snapshot()
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.roster.contains(client_id)
    }

    pub fn participant_count(&self) -> usize {
        self.roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.ledger.entries()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn set_delay(&mut self, delay: Duration) {
        info!("session {}: simulated delay set to {:?}", self.id, delay);
        self.delay = delay;
    }

    pub fn join(&mut self, client_id: ClientId, username: impl Into<String>) -> JoinSnapshot {
        let participant = self.roster.join(client_id, username);
        info!("session {}: {} joined as {:?}", self.id, client_id, participant.username);
        JoinSnapshot {
            client_id,
            revision: self.revision(),
            text: self.document.as_str().to_string(),
            participants: self.roster.snapshot(),
        }
    }

    pub fn leave(&mut self, client_id: &ClientId) -> Option<Participant> {
        let left = self.roster.leave(client_id);
        if left.is_some() {
            info!("session {}: {} left", self.id, client_id);
        }
        left
    }

    /// Record a cursor move, clamped to the current document.
    pub fn update_cursor(
        &mut self,
        client_id: &ClientId,
        position: usize,
        selection_end: usize,
    ) -> Result<Participant, SessionError> {
        let len = self.document.len();
        self.roster
            .update_cursor(client_id, position.min(len), selection_end.min(len))
            .cloned()
            .ok_or(SessionError::UnknownParticipant(*client_id))
    }

    /// Apply an edit batch submitted by `origin`.
    ///
    /// Stale batches are validated against the document as it was at their
    /// base revision, then rebased over the ledger. The batch is validated
    /// as a whole; on error the document is untouched.
    pub fn submit(&mut self, origin: ClientId, batch: EditBatch) -> Result<SubmitOutcome, SessionError> {
        let author = self.author(&origin)?;

        if let Some(seen) = self.recent.iter().find(|r| r.batch_id == batch.batch_id) {
            debug!("session {}: duplicate batch {} from {}", self.id, batch.batch_id, origin);
            return Ok(SubmitOutcome::Duplicate {
                revision: seen.revision,
                operations: seen.operations.clone(),
            });
        }

        let current = self.revision();
        if batch.base_revision > current {
            return Err(SessionError::FutureRevision {
                submitted: batch.base_revision,
                current,
            });
        }
        let edits = if batch.base_revision < current {
            let missed = self.ledger.since(batch.base_revision);
            let drift: isize = missed.iter().map(|entry| entry.operation.edit.len_delta()).sum();
            let base_len = (self.document.len() as isize - drift) as usize;
            if let Err(err) = validate_batch(&batch.operations, base_len) {
                warn!(
                    "session {}: rejected stale batch from {} at revision {}: {}",
                    self.id, origin, batch.base_revision, err
                );
                return Err(err.into());
            }
            debug!(
                "session {}: rebasing batch from {} over {} operation(s)",
                self.id,
                origin,
                missed.len()
            );
            rebase(batch.operations, missed)
        } else {
            batch.operations
        };

        let applied = self.apply_group(origin, &author, edits, LedgerAction::Edit)?;
        if !applied.entries.is_empty() {
            self.ledger.append(applied.entries.iter().cloned());
        }
        self.remember(batch.batch_id, applied.revision, applied.edits());
        Ok(SubmitOutcome::Applied(applied))
    }

    /// Reverse the most recent not-yet-undone group. `None` when there is
    /// nothing to undo.
    pub fn undo(&mut self, origin: ClientId) -> Result<Option<AppliedBatch>, SessionError> {
        let author = self.author(&origin)?;
        let Some(reversal) = self.ledger.undo_target() else {
            debug!("session {}: nothing to undo", self.id);
            return Ok(None);
        };
        let edits = rebase(reversal.edits, self.ledger.since(reversal.base_revision));
        if edits.is_empty() {
            self.ledger.discard_undo(reversal.group);
            return Ok(None);
        }
        let target = reversal.group;
        match self.apply_group(origin, &author, edits, LedgerAction::Undo { target }) {
            Ok(applied) => {
                self.ledger.record_undo(target, applied.entries.clone());
                Ok(Some(applied))
            }
            Err(err) => {
                warn!("session {}: undo of {} failed: {}", self.id, target, err);
                self.ledger.discard_undo(target);
                Err(err.into())
            }
        }
    }

    /// Re-apply the group reversed by the most recent undo.
    pub fn redo(&mut self, origin: ClientId) -> Result<Option<AppliedBatch>, SessionError> {
        let author = self.author(&origin)?;
        let Some(reversal) = self.ledger.redo_target() else {
            debug!("session {}: nothing to redo", self.id);
            return Ok(None);
        };
        let edits = rebase(reversal.edits, self.ledger.since(reversal.base_revision));
        let target = reversal.group;
        if edits.is_empty() {
            self.ledger.discard_redo(target);
            return Ok(None);
        }
        match self.apply_group(origin, &author, edits, LedgerAction::Redo { target }) {
            Ok(applied) => {
                self.ledger.record_redo(target, applied.entries.clone());
                Ok(Some(applied))
            }
            Err(err) => {
                warn!("session {}: redo of {} failed: {}", self.id, target, err);
                self.ledger.discard_redo(target);
                Err(err.into())
            }
        }
    }

    fn author(&self, origin: &ClientId) -> Result<String, SessionError> {
        self.roster
            .get(origin)
            .map(|p| p.username.clone())
            .ok_or(SessionError::UnknownParticipant(*origin))
    }

    fn apply_group(
        &mut self,
        origin: ClientId,
        author: &str,
        edits: Vec<Edit>,
        action: LedgerAction,
    ) -> Result<AppliedBatch, OperationError> {
        if let Err(err) = self.document.check_batch(&edits) {
            warn!("session {}: rejected batch from {}: {}", self.id, origin, err);
            return Err(err);
        }

        let base_revision = self.revision();
        let group = Uuid::new_v4();
        let mut operations = Vec::with_capacity(edits.len());
        let mut entries = Vec::with_capacity(edits.len());
        for (i, edit) in edits.into_iter().enumerate() {
            let applied = self.document.apply(&edit)?;
            let operation = Operation::new(edit, origin);
            entries.push(HistoryEntry {
                timestamp: operation.timestamp,
                operation: operation.clone(),
                removed: applied.removed,
                applied_revision: base_revision + i as u64 + 1,
                author: author.to_string(),
                group,
                action,
            });
            operations.push(operation);
        }

        let revision = base_revision + operations.len() as u64;
        debug!(
            "session {}: applied {} operation(s) from {}, revision {} -> {}",
            self.id,
            operations.len(),
            origin,
            base_revision,
            revision
        );
        Ok(AppliedBatch {
            origin,
            base_revision,
            revision,
            operations,
            entries,
        })
    }

    fn remember(&mut self, batch_id: Uuid, revision: u64, operations: Vec<Edit>) {
        if self.dedup_window == 0 {
            return;
        }
        if self.recent.len() >= self.dedup_window {
            self.recent.pop_front();
        }
        self.recent.push_back(RecentBatch {
            batch_id,
            revision,
            operations,
        });
    }
}
