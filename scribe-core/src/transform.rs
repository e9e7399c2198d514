//! Server-side rebase of stale submissions.
//!
//! A client that submits against revision `b` while the authority is at
//! `r > b` computed its positions without seeing the `r - b` operations
//! applied in between. Both sides are sequences: edit `i` of the batch is
//! expressed after edits `0..i`, so the applied edits are carried across
//! each incoming edit before the next one is rebased. Clients never
//! transform, so this is a rebase and not a full OT system.

use crate::history::HistoryEntry;
use crate::operation::Edit;

/// Rebase `edits` over the entries applied since the client's base revision.
pub fn rebase(edits: Vec<Edit>, applied: &[HistoryEntry]) -> Vec<Edit> {
    if applied.is_empty() {
        return edits;
    }
    let applied = applied.iter().map(|entry| entry.operation.edit.clone()).collect();
    cross(edits, applied).0
}

/// Carry `incoming` across `applied` and `applied` across `incoming`.
///
/// Both sequences start from the same document. The first result applies
/// after `applied`, the second after `incoming`.
fn cross(incoming: Vec<Edit>, mut applied: Vec<Edit>) -> (Vec<Edit>, Vec<Edit>) {
    let mut rebased = Vec::with_capacity(incoming.len());
    for edit in incoming {
        let mut pieces = vec![edit];
        let mut carried = Vec::with_capacity(applied.len());
        for other in applied {
            let (next, others) = match pieces.len() {
                0 => (pieces, vec![other]),
                1 => {
                    let others = carry(other.clone(), &pieces[0], true);
                    let next: Vec<Edit> = pieces
                        .into_iter()
                        .flat_map(|piece| transform(piece, &other))
                        .collect();
                    (next, others)
                }
                // A delete split around an applied insert.
                _ => cross(pieces, vec![other]),
            };
            pieces = next;
            carried.extend(others);
        }
        applied = carried;
        rebased.extend(pieces);
    }
    (rebased, applied)
}

/// Carry `incoming` across one already-applied edit.
///
/// Returns zero pieces when a delete was entirely consumed by an applied
/// delete, and two when an applied insert landed inside an incoming delete
/// range (the inserted text is preserved).
pub fn transform(incoming: Edit, applied: &Edit) -> Vec<Edit> {
    carry(incoming, applied, false)
}

/// Carry `edit` across `over`. On inserts at the same position the side
/// with `keeps_left` stays in front.
fn carry(edit: Edit, over: &Edit, keeps_left: bool) -> Vec<Edit> {
    match (edit, over) {
        (Edit::Insert { position, text }, Edit::Insert { position: at, .. }) => {
            let shifted = if keeps_left { position > *at } else { position >= *at };
            let position = if shifted {
                position.saturating_add(over.char_len())
            } else {
                position
            };
            vec![Edit::Insert { position, text }]
        }
        (Edit::Delete { position, length }, Edit::Insert { position: at, .. }) => {
            let inserted = over.char_len();
            let end = position.saturating_add(length);
            if position >= *at {
                vec![Edit::delete(position.saturating_add(inserted), length)]
            } else if *at < end {
                let head = at - position;
                vec![
                    Edit::delete(position, head),
                    Edit::delete(position.saturating_add(inserted), length - head),
                ]
            } else {
                vec![Edit::delete(position, length)]
            }
        }
        (Edit::Insert { position, text }, Edit::Delete { position: at, length: gone }) => {
            let gone_end = at.saturating_add(*gone);
            let position = if position <= *at {
                position
            } else if position >= gone_end {
                position - gone
            } else {
                *at
            };
            vec![Edit::Insert { position, text }]
        }
        (Edit::Delete { position, length }, Edit::Delete { position: at, length: gone }) => {
            let end = position.saturating_add(length);
            let gone_end = at.saturating_add(*gone);
            let overlap = end.min(gone_end).saturating_sub(position.max(*at));
            let remaining = length - overlap;
            if remaining == 0 {
                return Vec::new();
            }
            let position = if position <= *at {
                position
            } else if position >= gone_end {
                position - gone
            } else {
                *at
            };
            vec![Edit::delete(position, remaining)]
        }
    }
}
