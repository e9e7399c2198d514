//! Canonical representation of a text change.
//!
//! An [`Edit`] is the position-addressed mutation itself (insert or delete).
//! An [`Operation`] wraps an edit with the identity metadata the authority
//! stamps on it when it is applied: a unique id, the originating client and
//! a wall-clock timestamp.
//!
//! Positions and lengths are counted in Unicode scalar values (`char`s),
//! never bytes, so every participant agrees on offsets regardless of how
//! the text is encoded on their side.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Ephemeral identity of one connected participant.
///
/// Assigned by the authority when a connection joins a session and
/// discarded on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil id, used for operations synthesized by the authority itself.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is plenty for logs.
        let s = self.0.simple().to_string();
        write!(f, "client-{}", &s[..8])
    }
}

/// A single position-addressed text mutation.
///
/// `position` is an offset into the document as it exists immediately
/// before this edit is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edit {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
}

impl Edit {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Edit::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Edit::Delete { position, length }
    }

    pub fn position(&self) -> usize {
        match self {
            Edit::Insert { position, .. } | Edit::Delete { position, .. } => *position,
        }
    }

    /// Number of characters this edit inserts or removes.
    pub fn char_len(&self) -> usize {
        match self {
            Edit::Insert { text, .. } => text.chars().count(),
            Edit::Delete { length, .. } => *length,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Edit::Insert { .. })
    }

    /// Net change in document length once applied.
    pub fn len_delta(&self) -> isize {
        match self {
            Edit::Insert { .. } => self.char_len() as isize,
            Edit::Delete { length, .. } => -(*length as isize),
        }
    }

    /// Check the edit against a document of `doc_len` characters.
    pub fn validate(&self, doc_len: usize) -> Result<(), OperationError> {
        match self {
            Edit::Insert { position, text } => {
                if text.is_empty() {
                    return Err(OperationError::EmptyInsert { position: *position });
                }
                if *position > doc_len {
                    return Err(OperationError::OutOfBounds {
                        position: *position,
                        length: 0,
                        doc_len,
                    });
                }
            }
            Edit::Delete { position, length } => {
                if *length == 0 {
                    return Err(OperationError::EmptyDelete { position: *position });
                }
                match position.checked_add(*length) {
                    Some(end) if end <= doc_len => {}
                    _ => {
                        return Err(OperationError::OutOfBounds {
                            position: *position,
                            length: *length,
                            doc_len,
                        })
                    }
                }
            }
        }
        Ok(())
    }
}

/// Validate a batch against a document of `doc_len` characters.
///
/// Each edit is checked against the length left by the edits before it.
pub fn validate_batch(edits: &[Edit], doc_len: usize) -> Result<(), OperationError> {
    let mut len = doc_len;
    for edit in edits {
        edit.validate(len)?;
        len = (len as isize + edit.len_delta()) as usize;
    }
    Ok(())
}

impl fmt::Display for Edit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edit::Insert { position, text } => write!(f, "insert {text:?} at {position}"),
            Edit::Delete { position, length } => write!(f, "delete {length} chars at {position}"),
        }
    }
}

/// An edit as applied by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub edit: Edit,
    pub origin: ClientId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Operation {
    pub fn new(edit: Edit, origin: ClientId) -> Self {
        Self {
            id: Uuid::new_v4(),
            edit,
            origin,
            timestamp: now_millis(),
        }
    }
}

/// Reasons an edit cannot be applied to a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("operation at {position} (length {length}) exceeds document length {doc_len}")]
    OutOfBounds {
        position: usize,
        length: usize,
        doc_len: usize,
    },
    #[error("empty insert at {position}")]
    EmptyInsert { position: usize },
    #[error("zero-length delete at {position}")]
    EmptyDelete { position: usize },
}

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
