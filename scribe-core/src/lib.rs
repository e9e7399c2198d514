//! # scribe-core: text synchronization core for Scribe
//!
//! Pure, synchronous building blocks of the collaborative editing protocol.
//! Nothing here does I/O; time is passed in as [`std::time::Instant`].
//!
//! ## Data flow
//!
//! ```text
//!  keystroke ──▶ LocalEditPipeline ──▶ extract() ──▶ EditBatch ──▶ authority
//!                                                                    │
//!                                                      Session::submit (rebase,
//!                                                      validate, apply, ledger)
//!                                                                    │
//!  cursor fix ◀── apply_remote() ◀── Editor::handle_update ◀── update ┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: `Edit`, `Operation`, `ClientId`
//! - [`document`]: char-addressed text buffer
//! - [`diff`]: prefix/suffix diff extractor
//! - [`pipeline`]: debounced local edit capture
//! - [`apply`]: remote application with cursor correction
//! - [`mode`]: input-mode state machine (Idle / ApplyingRemote / Replaying)
//! - [`transform`]: rebase of stale submissions
//! - [`history`]: append-only ledger, undo and redo
//! - [`replay`]: step-by-step ledger reconstruction
//! - [`presence`]: participant roster
//! - [`outbox`]: unacknowledged batches
//! - [`session`]: authoritative session state
//! - [`editor`]: client-side mirror

pub mod apply;
pub mod diff;
pub mod document;
pub mod editor;
pub mod history;
pub mod mode;
pub mod operation;
pub mod outbox;
pub mod pipeline;
pub mod presence;
pub mod replay;
pub mod session;
pub mod transform;

pub use apply::{apply_remote, offset_shift, Cursor, OffsetTracker, RemoteApplied};
pub use diff::extract;
pub use document::{AppliedEdit, TextDocument};
pub use editor::{
    AckOutcome, Editor, EditorConfig, EditorError, RemoteUpdate, SyncState, UpdateOutcome,
};
pub use history::{HistoryEntry, HistoryLedger, LedgerAction, Reversal};
pub use mode::{InputGate, InputMode, ModeGuard};
pub use operation::{now_millis, validate_batch, ClientId, Edit, Operation, OperationError};
pub use outbox::{EditBatch, InFlight, Outbox};
pub use pipeline::{LocalEditPipeline, PendingBatch, PipelineConfig};
pub use presence::{Participant, Roster};
pub use replay::{Replay, ReplayFrame};
pub use session::{AppliedBatch, JoinSnapshot, Session, SessionError, SubmitOutcome};
pub use transform::{rebase, transform};
