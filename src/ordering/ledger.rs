//! Position ledger for ordered siblings
//!
//! Pure planning functions over the `(id, position)` pairs of one container.
//! Every function returns only the updates that must be written; applying them
//! atomically is the store's job.
//!
//! Positions are zero-based. After any completed operation a container holds
//! exactly the positions `0..n`. Inputs must be sorted ascending by position,
//! which lets the shifted span be located by binary search: the work done is
//! proportional to the span that moves, not the size of the container.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// One sibling inside a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sibling {
    pub id: i64,
    pub position: i64,
}

impl Sibling {
    pub fn new(id: i64, position: i64) -> Self {
        Self { id, position }
    }
}

/// A position that must be written for an existing sibling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub id: i64,
    pub position: i64,
}

impl PositionUpdate {
    pub fn new(id: i64, position: i64) -> Self {
        Self { id, position }
    }
}

/// Result of planning an insert: where the new sibling goes and who shifts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPlan {
    pub position: i64,
    pub shifts: Vec<PositionUpdate>,
}

fn debug_assert_sorted(existing: &[Sibling]) {
    debug_assert!(
        existing.windows(2).all(|w| w[0].position <= w[1].position),
        "siblings must be sorted by position"
    );
}

/// Index of the first sibling whose position is `>= position`.
fn lower_bound(existing: &[Sibling], position: i64) -> usize {
    existing.partition_point(|s| s.position < position)
}

/// Index of the first sibling whose position is `> position`.
fn upper_bound(existing: &[Sibling], position: i64) -> usize {
    existing.partition_point(|s| s.position <= position)
}

/// Plan an insert.
///
/// Without a target the new sibling is appended at `max(position) + 1` (or 0
/// when empty) and nothing else moves. With a target, the target is clamped to
/// `[0, count]` and every sibling at or after it shifts up by one.
pub fn plan_insert(existing: &[Sibling], target: Option<i64>) -> InsertPlan {
    debug_assert_sorted(existing);

    let Some(target) = target else {
        let position = existing.last().map(|s| s.position + 1).unwrap_or(0);
        return InsertPlan {
            position,
            shifts: Vec::new(),
        };
    };

    let position = target.clamp(0, existing.len() as i64);
    let shifts = existing[lower_bound(existing, position)..]
        .iter()
        .map(|s| PositionUpdate::new(s.id, s.position + 1))
        .collect();

    InsertPlan { position, shifts }
}

/// Plan the gap closure after the sibling at `deleted_position` is removed.
pub fn plan_delete(existing: &[Sibling], deleted_position: i64) -> Vec<PositionUpdate> {
    debug_assert_sorted(existing);

    existing[upper_bound(existing, deleted_position)..]
        .iter()
        .map(|s| PositionUpdate::new(s.id, s.position - 1))
        .collect()
}

/// Plan moving the sibling at `old_position` so it ends at index `new_position`.
///
/// `new_position` is the final index in the resulting sequence and is clamped
/// to `[0, count - 1]`. Only the span between the two positions shifts; the
/// moved sibling's own update comes last.
pub fn plan_move(
    existing: &[Sibling],
    old_position: i64,
    new_position: i64,
) -> Result<Vec<PositionUpdate>, StorageError> {
    debug_assert_sorted(existing);

    let start = lower_bound(existing, old_position);
    let moved = match existing.get(start) {
        Some(s) if s.position == old_position => *s,
        _ => {
            return Err(StorageError::InvalidInput(format!(
                "no sibling at position {}",
                old_position
            )))
        }
    };

    let new_position = new_position.clamp(0, existing.len() as i64 - 1);
    if new_position == old_position {
        return Ok(Vec::new());
    }

    let mut updates: Vec<PositionUpdate> = if new_position > old_position {
        // (old, new] slides down
        existing[upper_bound(existing, old_position)..upper_bound(existing, new_position)]
            .iter()
            .map(|s| PositionUpdate::new(s.id, s.position - 1))
            .collect()
    } else {
        // [new, old) slides up
        existing[lower_bound(existing, new_position)..start]
            .iter()
            .map(|s| PositionUpdate::new(s.id, s.position + 1))
            .collect()
    };
    updates.push(PositionUpdate::new(moved.id, new_position));

    Ok(updates)
}

/// Plan a full reorder: each id takes its index in `ordered_ids`.
///
/// The list must contain exactly the current members of the container, once
/// each. Any mismatch is rejected as a whole.
pub fn plan_bulk_reorder(
    existing: &[Sibling],
    ordered_ids: &[i64],
) -> Result<Vec<PositionUpdate>, StorageError> {
    if ordered_ids.len() != existing.len() {
        return Err(StorageError::InvalidInput(format!(
            "reorder lists {} ids but the container holds {}",
            ordered_ids.len(),
            existing.len()
        )));
    }

    let current: HashMap<i64, i64> = existing.iter().map(|s| (s.id, s.position)).collect();
    let mut seen = HashSet::with_capacity(ordered_ids.len());
    let mut updates = Vec::new();

    for (index, id) in ordered_ids.iter().enumerate() {
        if !seen.insert(*id) {
            return Err(StorageError::InvalidInput(format!("id {} listed twice", id)));
        }
        let Some(position) = current.get(id) else {
            return Err(StorageError::InvalidInput(format!(
                "id {} is not in this container",
                id
            )));
        };
        if *position != index as i64 {
            updates.push(PositionUpdate::new(*id, index as i64));
        }
    }

    Ok(updates)
}

/// Plan a repair that closes gaps and breaks ties, keeping the current order
/// (ties are broken by id).
pub fn plan_normalize(existing: &[Sibling]) -> Vec<PositionUpdate> {
    let mut ordered = existing.to_vec();
    ordered.sort_by_key(|s| (s.position, s.id));

    ordered
        .iter()
        .enumerate()
        .filter(|(index, s)| s.position != *index as i64)
        .map(|(index, s)| PositionUpdate::new(s.id, index as i64))
        .collect()
}

/// True when positions are exactly `0..n` with no duplicates.
pub fn is_contiguous(existing: &[Sibling]) -> bool {
    let mut positions: Vec<i64> = existing.iter().map(|s| s.position).collect();
    positions.sort_unstable();
    positions.iter().enumerate().all(|(i, p)| *p == i as i64)
}
