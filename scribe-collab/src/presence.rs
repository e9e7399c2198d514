//! Client-side presence: remote cursors, their colors, and the cursor
//! throttle shared by client and server.
//!
//! ## Flow
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! PresenceRoom::update_local_cursor()
//!       │  (CursorThrottle: one per interval, last value wins)
//!       ▼
//! cursor ──▶ authority ──▶ cursor_update (throttled again per participant)
//!                                 │
//!                                 ▼
//!                    PresenceRoom::handle_cursor_update()
//!                                 │
//!                 remote text ops │ shift_cursors()
//!                                 ▼
//!                         remote_cursors()
//! ```
//!
//! Presence is advisory. Nothing here affects document text.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use scribe_core::{ClientId, Cursor, Edit, OffsetTracker, Participant};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for a participant's cursor and selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a client id.
    pub fn from_client(id: ClientId) -> Self {
        let hash = id.as_uuid().as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb`, alpha ignored.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Throttle
// ───────────────────────────────────────────────────────────────────

/// At most one value per interval, last value wins, with a trailing flush
/// so the final value is never lost.
#[derive(Debug, Clone)]
pub struct CursorThrottle<T> {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<T>,
}

impl<T> CursorThrottle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
        }
    }

    /// Returns `value` if it may go out now; otherwise keeps it as the
    /// pending value, replacing any older one.
    pub fn offer(&mut self, value: T, now: Instant) -> Option<T> {
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.interval => {
                self.pending = Some(value);
                None
            }
            _ => {
                self.last_sent = Some(now);
                self.pending = None;
                Some(value)
            }
        }
    }

    /// When the pending value becomes due.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(self.last_sent? + self.interval)
    }

    /// The pending value, if its slot has arrived.
    pub fn flush(&mut self, now: Instant) -> Option<T> {
        if now < self.deadline()? {
            return None;
        }
        self.last_sent = Some(now);
        self.pending.take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

// ───────────────────────────────────────────────────────────────────
// Remote cursors
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub client_id: ClientId,
    pub username: String,
    pub position: usize,
    pub selection_end: usize,
    pub color: CursorColor,
    pub last_update: Instant,
}

impl RemoteCursor {
    fn new(client_id: ClientId, username: String) -> Self {
        Self {
            client_id,
            username,
            position: 0,
            selection_end: 0,
            color: CursorColor::from_client(client_id),
            last_update: Instant::now(),
        }
    }

    pub fn has_selection(&self) -> bool {
        self.position != self.selection_end
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

/// Presence state of one client in one session.
pub struct PresenceRoom {
    local_id: Option<ClientId>,
    peers: HashMap<ClientId, RemoteCursor>,
    throttle: CursorThrottle<Cursor>,
    idle_timeout: Duration,
}

impl PresenceRoom {
    pub fn new(cursor_interval: Duration) -> Self {
        Self {
            local_id: None,
            peers: HashMap::new(),
            throttle: CursorThrottle::new(cursor_interval),
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Set after `init`; messages about this id are ignored from then on.
    pub fn set_local_id(&mut self, id: ClientId) {
        self.local_id = Some(id);
        self.peers.remove(&id);
    }

    pub fn local_id(&self) -> Option<ClientId> {
        self.local_id
    }

    /// Reconcile with a roster from `init`, `user_joined` or `user_left`.
    pub fn sync_roster(&mut self, participants: &[Participant]) {
        self.peers
            .retain(|id, _| participants.iter().any(|p| p.id == *id));
        for participant in participants {
            if Some(participant.id) == self.local_id {
                continue;
            }
            let peer = self
                .peers
                .entry(participant.id)
                .or_insert_with(|| RemoteCursor::new(participant.id, participant.username.clone()));
            peer.username.clone_from(&participant.username);
            peer.position = participant.position;
            peer.selection_end = participant.selection_end;
        }
    }

    pub fn handle_cursor_update(
        &mut self,
        client_id: ClientId,
        username: &str,
        position: usize,
        selection_end: usize,
    ) {
        if Some(client_id) == self.local_id {
            return;
        }
        let peer = self
            .peers
            .entry(client_id)
            .or_insert_with(|| RemoteCursor::new(client_id, username.to_string()));
        peer.username = username.to_string();
        peer.position = position;
        peer.selection_end = selection_end;
        peer.last_update = Instant::now();
    }

    pub fn remove(&mut self, client_id: &ClientId) -> Option<RemoteCursor> {
        self.peers.remove(client_id)
    }

    /// Carry remote cursors across text operations applied to the mirror.
    pub fn shift_cursors(&mut self, edits: &[Edit], doc_len: usize) {
        for peer in self.peers.values_mut() {
            let mut position = OffsetTracker::new(peer.position);
            let mut selection_end = OffsetTracker::new(peer.selection_end);
            for edit in edits {
                position.observe(edit);
                selection_end.observe(edit);
            }
            peer.position = position.finish().min(doc_len);
            peer.selection_end = selection_end.finish().min(doc_len);
        }
    }

    /// Record the local cursor. Returns it if it should be sent now.
    pub fn update_local_cursor(&mut self, cursor: Cursor, now: Instant) -> Option<Cursor> {
        self.throttle.offer(cursor, now)
    }

    /// Trailing cursor value whose slot has arrived.
    pub fn flush_local_cursor(&mut self, now: Instant) -> Option<Cursor> {
        self.throttle.flush(now)
    }

    pub fn peer(&self, client_id: &ClientId) -> Option<&RemoteCursor> {
        self.peers.get(client_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Remote cursors ordered by username.
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        let mut cursors: Vec<RemoteCursor> = self.peers.values().cloned().collect();
        cursors.sort_by(|a, b| a.username.cmp(&b.username).then(a.client_id.cmp(&b.client_id)));
        cursors
    }

    /// Forget cursors without updates for longer than the idle timeout.
    /// They reappear on their next update.
    pub fn cleanup_idle_peers(&mut self) -> Vec<ClientId> {
        let timeout = self.idle_timeout;
        let stale: Vec<ClientId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
