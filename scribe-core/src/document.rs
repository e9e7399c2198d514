//! Owned, char-addressed text buffer.
//!
//! Offsets handed to [`TextDocument`] are character offsets; the conversion
//! to UTF-8 byte offsets happens here and nowhere else.

use serde::{Deserialize, Serialize};

use crate::operation::{validate_batch, Edit, OperationError};

/// Result of applying one edit: what was removed, if anything.
///
/// The removed text is what lets the history ledger build an exact
/// inverse of a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEdit {
    pub edit: Edit,
    pub removed: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDocument {
    text: String,
    /// Cached char count of `text`.
    len: usize,
}

impl TextDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let len = text.chars().count();
        Self { text, len }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Replace the whole content (snapshot sync).
    pub fn replace(&mut self, text: impl Into<String>) {
        *self = Self::from_text(text);
    }

    /// Text between two char offsets.
    pub fn slice(&self, start: usize, end: usize) -> &str {
        let from = self.byte_offset(start);
        let to = self.byte_offset(end);
        &self.text[from..to]
    }

    /// Validate a whole batch against this document without mutating it.
    ///
    /// Each edit is checked against the length the document will have once
    /// the preceding edits of the batch are applied.
    pub fn check_batch(&self, edits: &[Edit]) -> Result<(), OperationError> {
        validate_batch(edits, self.len)
    }

    /// Apply a single edit.
    pub fn apply(&mut self, edit: &Edit) -> Result<AppliedEdit, OperationError> {
        edit.validate(self.len)?;
        let removed = match edit {
            Edit::Insert { position, text } => {
                let at = self.byte_offset(*position);
                self.text.insert_str(at, text);
                self.len += text.chars().count();
                None
            }
            Edit::Delete { position, length } => {
                let from = self.byte_offset(*position);
                let to = self.byte_offset(position + length);
                let removed: String = self.text.drain(from..to).collect();
                self.len -= length;
                Some(removed)
            }
        };
        Ok(AppliedEdit {
            edit: edit.clone(),
            removed,
        })
    }

    /// Apply a batch in order, all or nothing.
    pub fn apply_batch(&mut self, edits: &[Edit]) -> Result<Vec<AppliedEdit>, OperationError> {
        self.check_batch(edits)?;
        edits.iter().map(|edit| self.apply(edit)).collect()
    }

    fn byte_offset(&self, char_offset: usize) -> usize {
        if char_offset >= self.len {
            return self.text.len();
        }
        self.text
            .char_indices()
            .nth(char_offset)
            .map(|(i, _)| i)
            .unwrap_or(self.text.len())
    }
}

impl From<&str> for TextDocument {
    fn from(text: &str) -> Self {
        Self::from_text(text)
    }
}
