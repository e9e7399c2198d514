//! Append-only history ledger with undo and redo.
//!
//! Every operation the authority applies becomes one [`HistoryEntry`].
//! Entries produced by the same submission share a `group` id, and undo and
//! redo work on whole groups so that a replace (delete then insert) is
//! reversed in one step. Undo never rewrites the log: it appends the
//! inverse operations as new entries tagged with the group they reverse.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::operation::{Edit, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAction {
    Edit,
    /// Reverses the entries of `target` group.
    Undo { target: Uuid },
    /// Re-applies the group reversed by the undo group `target`.
    Redo { target: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub operation: Operation,
    /// Text removed by a delete, kept so its inverse can restore it.
    pub removed: Option<String>,
    /// Session revision right after this entry was applied.
    pub applied_revision: u64,
    pub timestamp: u64,
    pub author: String,
    pub group: Uuid,
    pub action: LedgerAction,
}

impl HistoryEntry {
    /// The edit that exactly reverses this entry in the document state
    /// right after it was applied.
    pub fn inverse_edit(&self) -> Option<Edit> {
        match &self.operation.edit {
            Edit::Insert { position, .. } => Some(Edit::Delete {
                position: *position,
                length: self.operation.edit.char_len(),
            }),
            Edit::Delete { position, .. } => self.removed.as_ref().map(|text| Edit::Insert {
                position: *position,
                text: text.clone(),
            }),
        }
    }

    pub fn is_undoable(&self) -> bool {
        matches!(self.action, LedgerAction::Edit | LedgerAction::Redo { .. })
    }
}

/// A group reversal the ledger wants applied.
///
/// `edits` are expressed against the document at `base_revision`; callers
/// rebase them over [`HistoryLedger::since`] before applying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reversal {
    pub group: Uuid,
    pub base_revision: u64,
    pub edits: Vec<Edit>,
}

#[derive(Debug, Default)]
pub struct HistoryLedger {
    entries: Vec<HistoryEntry>,
    /// Groups that have been undone.
    undone: HashSet<Uuid>,
    /// Undo groups that can still be redone, most recent last.
    redo_stack: Vec<Uuid>,
}

impl HistoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Entries applied after `revision`.
    pub fn since(&self, revision: u64) -> &[HistoryEntry] {
        let start = (revision as usize).min(self.entries.len());
        &self.entries[start..]
    }

    /// Append the entries of a fresh edit. Clears the redo chain.
    pub fn append(&mut self, entries: impl IntoIterator<Item = HistoryEntry>) {
        self.redo_stack.clear();
        self.entries.extend(entries);
    }

    /// Most recent group that is an edit or redo and not yet undone.
    pub fn undo_target(&self) -> Option<Reversal> {
        let last = self
            .entries
            .iter()
            .rev()
            .find(|entry| entry.is_undoable() && !self.undone.contains(&entry.group))?;
        Some(self.reversal_of(last.group))
    }

    /// The undo group on top of the redo chain.
    pub fn redo_target(&self) -> Option<Reversal> {
        self.redo_stack.last().map(|group| self.reversal_of(*group))
    }

    /// Record the entries produced by undoing `target`.
    pub fn record_undo(&mut self, target: Uuid, entries: Vec<HistoryEntry>) {
        self.undone.insert(target);
        if let Some(group) = entries.first().map(|entry| entry.group) {
            self.redo_stack.push(group);
        }
        self.entries.extend(entries);
    }

    /// Record the entries produced by redoing the undo group `target`.
    pub fn record_redo(&mut self, target: Uuid, entries: Vec<HistoryEntry>) {
        if self.redo_stack.last() == Some(&target) {
            self.redo_stack.pop();
        }
        self.entries.extend(entries);
    }

    /// Mark a group undone without applying anything (its effect was
    /// already erased by later edits).
    pub fn discard_undo(&mut self, target: Uuid) {
        self.undone.insert(target);
    }

    /// Drop an undo group from the redo chain without applying anything.
    pub fn discard_redo(&mut self, target: Uuid) {
        self.redo_stack.retain(|group| *group != target);
    }

    fn reversal_of(&self, group: Uuid) -> Reversal {
        let members: Vec<&HistoryEntry> =
            self.entries.iter().filter(|entry| entry.group == group).collect();
        let base_revision = members
            .last()
            .map(|entry| entry.applied_revision)
            .unwrap_or(0);
        let edits = members
            .iter()
            .rev()
            .filter_map(|entry| entry.inverse_edit())
            .collect();
        Reversal {
            group,
            base_revision,
            edits,
        }
    }
}
