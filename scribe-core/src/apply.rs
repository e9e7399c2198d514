//! Remote apply engine.
//!
//! Applies an ordered batch of edits from the authority to a local mirror
//! and re-derives the local cursor so it keeps its semantic place in the
//! text instead of a now-stale numeric offset.

use serde::{Deserialize, Serialize};

use crate::document::{AppliedEdit, TextDocument};
use crate::mode::InputGate;
use crate::operation::{Edit, OperationError};

/// Caret position plus the far end of the selection (equal when nothing
/// is selected). Both are char offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cursor {
    pub position: usize,
    pub selection_end: usize,
}

impl Cursor {
    pub fn at(position: usize) -> Self {
        Self {
            position,
            selection_end: position,
        }
    }

    pub fn with_selection(position: usize, selection_end: usize) -> Self {
        Self {
            position,
            selection_end,
        }
    }

    pub fn clamp(self, len: usize) -> Self {
        Self {
            position: self.position.min(len),
            selection_end: self.selection_end.min(len),
        }
    }
}

/// How far an offset moves because of one edit applied before it.
///
/// Edits at or before the offset push it right by the inserted length, or
/// pull it left by the part of the deleted range that lies before it.
pub fn offset_shift(edit: &Edit, offset: usize) -> isize {
    match edit {
        Edit::Insert { position, .. } if *position <= offset => edit.char_len() as isize,
        Edit::Delete { position, length } if *position <= offset => {
            -((*length).min(offset - position) as isize)
        }
        _ => 0,
    }
}

/// Accumulates the shift of one offset across a batch.
#[derive(Debug, Clone, Copy)]
pub struct OffsetTracker {
    origin: usize,
    shift: isize,
}

impl OffsetTracker {
    pub fn new(origin: usize) -> Self {
        Self { origin, shift: 0 }
    }

    /// Offset with the adjustment accumulated so far.
    pub fn current(&self) -> usize {
        (self.origin as isize + self.shift).max(0) as usize
    }

    /// Record an edit; must be called before the edit is applied.
    pub fn observe(&mut self, edit: &Edit) {
        self.shift += offset_shift(edit, self.current());
    }

    pub fn finish(self) -> usize {
        self.current()
    }
}

/// Outcome of a remote application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteApplied {
    pub cursor: Cursor,
    pub applied: Vec<AppliedEdit>,
}

/// Apply `edits` in order to `document`, carrying `cursor` along.
///
/// The whole batch is validated first; on error nothing is mutated. The
/// gate is held in `ApplyingRemote` for the duration of the mutation.
pub fn apply_remote(
    gate: &mut InputGate,
    document: &mut TextDocument,
    edits: &[Edit],
    cursor: Cursor,
) -> Result<RemoteApplied, OperationError> {
    document.check_batch(edits)?;

    let mut position = OffsetTracker::new(cursor.position);
    let mut selection_end = OffsetTracker::new(cursor.selection_end);
    let mut applied = Vec::with_capacity(edits.len());

    let _guard = gate.applying_remote();
    for edit in edits {
        position.observe(edit);
        selection_end.observe(edit);
        applied.push(document.apply(edit)?);
    }

    let cursor = Cursor::with_selection(position.finish(), selection_end.finish())
        .clamp(document.len());
    Ok(RemoteApplied { cursor, applied })
}
