//! Prefix/suffix diff between two document snapshots.
//!
//! Produces at most two edits: a delete of the changed middle of the old
//! text followed by an insert of the changed middle of the new text, both
//! at the end of the common prefix. This is a heuristic, not a minimum edit
//! distance: a transposition or an interior reorder becomes one wide
//! replace. It is always round-trip faithful.

use crate::operation::Edit;

/// Compute the edits that turn `old` into `new`.
///
/// The delete (if any) comes first; the insert that follows is expressed
/// against the post-delete text, and since both start at the same offset
/// the two positions coincide.
pub fn extract(old: &str, new: &str) -> Vec<Edit> {
    if old == new {
        return Vec::new();
    }

    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();

    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();

    // Suffix scan must not run into the prefix on either side.
    let mut old_end = old.len();
    let mut new_end = new.len();
    while old_end > prefix && new_end > prefix && old[old_end - 1] == new[new_end - 1] {
        old_end -= 1;
        new_end -= 1;
    }

    let mut edits = Vec::with_capacity(2);
    if old_end > prefix {
        edits.push(Edit::Delete {
            position: prefix,
            length: old_end - prefix,
        });
    }
    if new_end > prefix {
        edits.push(Edit::Insert {
            position: prefix,
            text: new[prefix..new_end].iter().collect(),
        });
    }
    edits
}
