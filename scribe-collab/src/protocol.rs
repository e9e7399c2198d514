//! Session channel messages and their two wire encodings.
//!
//! Binary frames carry bincode (`config::standard()`), text frames carry the
//! same enums as JSON. Both enums use serde's external tagging with
//! `snake_case` variant names:
//!
//! ```text
//! binary: [variant index][fields ...]            (bincode, varint ints)
//! json:   {"edit": {"session_id": "...", ...}}  (serde_json)
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use scribe_core::{ClientId, Edit, EditBatch, EditorError, HistoryEntry, Participant};

/// Client to authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        session_id: String,
        username: String,
    },
    Edit {
        session_id: String,
        /// Revision the operations were computed against.
        revision: u64,
        batch_id: Uuid,
        operations: Vec<Edit>,
    },
    Cursor {
        session_id: String,
        position: usize,
        selection_end: usize,
        username: String,
    },
    RequestHistory {
        session_id: String,
    },
    Undo {
        session_id: String,
    },
    Redo {
        session_id: String,
    },
    SetDelay {
        session_id: String,
        delay_ms: u64,
    },
    Ping,
}

impl ClientMessage {
    pub fn edit(batch: EditBatch) -> Self {
        ClientMessage::Edit {
            session_id: batch.session_id,
            revision: batch.base_revision,
            batch_id: batch.batch_id,
            operations: batch.operations,
        }
    }

    /// Session the message addresses; `None` for `ping`.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Join { session_id, .. }
            | ClientMessage::Edit { session_id, .. }
            | ClientMessage::Cursor { session_id, .. }
            | ClientMessage::RequestHistory { session_id }
            | ClientMessage::Undo { session_id }
            | ClientMessage::Redo { session_id }
            | ClientMessage::SetDelay { session_id, .. } => Some(session_id),
            ClientMessage::Ping => None,
        }
    }

    /// The edit as a batch, if this is an `edit` message.
    pub fn into_batch(self) -> Option<EditBatch> {
        match self {
            ClientMessage::Edit {
                session_id,
                revision,
                batch_id,
                operations,
            } => Some(EditBatch {
                session_id,
                batch_id,
                base_revision: revision,
                operations,
            }),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Authority to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    Init {
        client_id: ClientId,
        revision: u64,
        text: String,
        participants: Vec<Participant>,
    },
    Update {
        /// Revision after the last operation.
        revision: u64,
        operations: Vec<Edit>,
        origin: ClientId,
    },
    Ack {
        batch_id: Uuid,
        revision: u64,
        /// Operations as the authority applied them.
        operations: Vec<Edit>,
        duplicate: bool,
    },
    Rejected {
        batch_id: Option<Uuid>,
        reason: String,
        revision: u64,
    },
    CursorUpdate {
        client_id: ClientId,
        position: usize,
        selection_end: usize,
        username: String,
    },
    UserJoined {
        client_id: ClientId,
        participants: Vec<Participant>,
    },
    UserLeft {
        client_id: ClientId,
        participants: Vec<Participant>,
    },
    History {
        entries: Vec<HistoryEntry>,
    },
    HistoryUpdate {
        entries: Vec<HistoryEntry>,
    },
    Pong,
}

impl ServerMessage {
    pub fn rejected(batch_id: Option<Uuid>, reason: impl ToString, revision: u64) -> Self {
        ServerMessage::Rejected {
            batch_id,
            reason: reason.to_string(),
            revision,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Frame encoding of a connection, fixed by its first data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Binary,
    Json,
}

impl WireFormat {
    /// Build a WebSocket frame for `value`.
    pub fn frame<T: Serialize>(self, value: &T) -> Result<Message, ProtocolError> {
        match self {
            WireFormat::Binary => Ok(Message::Binary(encode_binary(value)?.into())),
            WireFormat::Json => Ok(Message::Text(serde_json::to_string(value)?.into())),
        }
    }

    /// Decode a data frame. `None` for control frames.
    pub fn parse<T: DeserializeOwned>(message: &Message) -> Option<(Result<T, ProtocolError>, WireFormat)> {
        match message {
            Message::Binary(data) => Some((decode_binary(data), WireFormat::Binary)),
            Message::Text(text) => Some((
                serde_json::from_str(text.as_str()).map_err(ProtocolError::from),
                WireFormat::Json,
            )),
            _ => None,
        }
    }
}

fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not joined to a session")]
    NotJoined,
    #[error("connection is joined to {expected:?}, message addressed {got:?}")]
    SessionMismatch { expected: String, got: String },
    #[error("connection timeout")]
    Timeout,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Editor(#[from] EditorError),
}
