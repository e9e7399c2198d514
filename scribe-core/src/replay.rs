//! Step-by-step reconstruction of a document from its ledger.

use crate::document::TextDocument;
use crate::history::HistoryEntry;
use crate::operation::OperationError;

/// One replay step: the entry just applied and the text it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFrame {
    pub index: usize,
    pub entry: HistoryEntry,
    pub text: String,
}

/// Rebuilds the document from empty by applying each entry in order.
#[derive(Debug)]
pub struct Replay {
    entries: Vec<HistoryEntry>,
    document: TextDocument,
    cursor: usize,
}

impl Replay {
    pub fn new(entries: Vec<HistoryEntry>) -> Self {
        Self {
            entries,
            document: TextDocument::new(),
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.entries.len()
    }

    /// Text reconstructed so far.
    pub fn text(&self) -> &str {
        self.document.as_str()
    }

    /// Apply the next entry. `None` once every entry has been replayed.
    pub fn next_frame(&mut self) -> Option<Result<ReplayFrame, OperationError>> {
        let entry = self.entries.get(self.cursor)?.clone();
        let index = self.cursor;
        self.cursor += 1;
        Some(self.document.apply(&entry.operation.edit).map(|_| ReplayFrame {
            index,
            entry,
            text: self.document.as_str().to_string(),
        }))
    }
}

impl Iterator for Replay {
    type Item = Result<ReplayFrame, OperationError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::LedgerAction;
    use crate::operation::{ClientId, Edit, Operation};
    use uuid::Uuid;

    fn entries(edits: Vec<Edit>) -> Vec<HistoryEntry> {
        edits
            .into_iter()
            .enumerate()
            .map(|(i, edit)| {
                let operation = Operation::new(edit, ClientId::nil());
                HistoryEntry {
                    timestamp: operation.timestamp,
                    operation,
                    removed: None,
                    applied_revision: i as u64 + 1,
                    author: "bob".into(),
                    group: Uuid::new_v4(),
                    action: LedgerAction::Edit,
                }
            })
            .collect()
    }

    #[test]
    fn test_frames_rebuild_document() {
        let replay = Replay::new(entries(vec![
            Edit::insert(0, "hello"),
            Edit::delete(1, 1),
            Edit::insert(1, "a"),
        ]));
        let texts: Vec<String> = replay.map(|frame| frame.unwrap().text).collect();
        assert_eq!(texts, vec!["hello", "hllo", "hallo"]);
    }

    #[test]
    fn test_finished_state() {
        let mut replay = Replay::new(entries(vec![Edit::insert(0, "x")]));
        assert!(!replay.is_finished());
        let frame = replay.next_frame().unwrap().unwrap();
        assert_eq!(frame.index, 0);
        assert!(replay.is_finished());
        assert!(replay.next_frame().is_none());
        assert_eq!(replay.text(), "x");
    }

    #[test]
    fn test_corrupt_ledger_surfaces_error() {
        let mut replay = Replay::new(entries(vec![Edit::delete(0, 3)]));
        assert!(replay.next_frame().unwrap().is_err());
    }
}
