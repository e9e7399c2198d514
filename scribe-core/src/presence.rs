//! Participant roster owned by a session.
//!
//! Presence is advisory. Nothing here is consulted for text correctness,
//! and each record lives exactly from `join` to the matching `leave`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::operation::ClientId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ClientId,
    pub username: String,
    pub position: usize,
    pub selection_end: usize,
}

#[derive(Debug, Clone)]
struct Slot {
    participant: Participant,
    /// Join order, for a stable roster listing.
    seq: u64,
}

#[derive(Debug, Default)]
pub struct Roster {
    participants: HashMap<ClientId, Slot>,
    next_seq: u64,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant. Joining again with the same id renames it
    /// and keeps its place in the listing.
    pub fn join(&mut self, id: ClientId, username: impl Into<String>) -> &Participant {
        let username = username.into();
        let next_seq = &mut self.next_seq;
        let slot = self.participants.entry(id).or_insert_with(|| {
            *next_seq += 1;
            Slot {
                participant: Participant {
                    id,
                    username: String::new(),
                    position: 0,
                    selection_end: 0,
                },
                seq: *next_seq,
            }
        });
        slot.participant.username = username;
        &slot.participant
    }

    pub fn leave(&mut self, id: &ClientId) -> Option<Participant> {
        self.participants.remove(id).map(|slot| slot.participant)
    }

    pub fn get(&self, id: &ClientId) -> Option<&Participant> {
        self.participants.get(id).map(|slot| &slot.participant)
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.participants.contains_key(id)
    }

    /// Store the latest cursor for `id`. Returns the updated record, or
    /// `None` for an unknown participant.
    pub fn update_cursor(
        &mut self,
        id: &ClientId,
        position: usize,
        selection_end: usize,
    ) -> Option<&Participant> {
        let slot = self.participants.get_mut(id)?;
        slot.participant.position = position;
        slot.participant.selection_end = selection_end;
        Some(&slot.participant)
    }

    /// All participants in join order.
    pub fn snapshot(&self) -> Vec<Participant> {
        let mut slots: Vec<&Slot> = self.participants.values().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.participant.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
