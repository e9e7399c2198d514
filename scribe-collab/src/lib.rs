//! # scribe-collab: networked sessions for Scribe
//!
//! Runs the authority as a WebSocket server and provides a matching client.
//! Every session lives in one room that owns the authoritative
//! [`scribe_core::Session`]; clients keep an [`scribe_core::Editor`] mirror.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │  bincode or JSON    │ (authority) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Editor      │                     │ SessionRoom │
//! │ (mirror)    │                     │ (Session)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: client and server messages, binary and JSON framing
//! - [`broadcast`]: per-session fan-out
//! - [`room`]: session rooms and their lifetime
//! - [`presence`]: cursor colors, throttling and remote cursors
//! - [`server`]: WebSocket authority
//! - [`client`]: WebSocket client with reconnect and replay

pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Outbound};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use presence::{CursorColor, CursorThrottle, PresenceRoom, RemoteCursor};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage, WireFormat};
pub use room::{RoomManager, SessionRoom};
pub use server::{ServerConfig, ServerStats, SyncServer};
