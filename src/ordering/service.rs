//! Ordering service - applies ledger plans through a sibling store
//!
//! Each public operation is one store transaction: read the container's
//! positions, plan, write. The container is never observed half-shifted.

use std::sync::Arc;

use tracing::debug;

use crate::error::StorageError;
use crate::services::events::{EventBus, StorageEvent};

use super::ledger::{self, Sibling};
use super::store::{SiblingPayload, SiblingScope, SiblingStore};

pub struct OrderingService<S> {
    store: Arc<S>,
    events: Arc<EventBus>,
}

impl<S: SiblingStore> OrderingService<S> {
    pub fn new(store: Arc<S>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    /// Siblings of a container, ascending by position
    pub fn positions(
        &self,
        scope: &SiblingScope,
        container_id: i64,
    ) -> Result<Vec<Sibling>, StorageError> {
        self.store
            .with_container(scope, container_id, |tx| tx.current_positions())
    }

    /// Insert a new sibling, appending when `position` is `None`.
    ///
    /// Returns the new sibling's id.
    pub fn insert(
        &self,
        scope: &SiblingScope,
        container_id: i64,
        position: Option<i64>,
        payload: &SiblingPayload,
    ) -> Result<i64, StorageError> {
        let (id, position, shifted) = self.store.with_container(scope, container_id, |tx| {
            let current = tx.current_positions()?;
            let plan = ledger::plan_insert(&current, position);
            tx.apply_updates(&plan.shifts)?;
            let id = tx.insert(plan.position, payload)?;
            Ok((id, plan.position, plan.shifts.len()))
        })?;

        debug!(scope = %scope, container_id, id, position, shifted, "Inserted sibling");
        self.events.emit(StorageEvent::SiblingInserted {
            table: scope.table,
            container_id,
            id,
            position,
            shifted,
        });

        Ok(id)
    }

    /// Delete a sibling and close the gap it leaves.
    ///
    /// Returns false when the sibling does not exist.
    pub fn delete(&self, scope: &SiblingScope, id: i64) -> Result<bool, StorageError> {
        let Some(container_id) = self.store.container_of(scope, id)? else {
            return Ok(false);
        };

        let shifted = self.store.with_container(scope, container_id, |tx| {
            let current = tx.current_positions()?;
            let Some(target) = current.iter().find(|s| s.id == id).copied() else {
                return Ok(None);
            };
            tx.remove(id)?;
            let remaining: Vec<Sibling> = current.into_iter().filter(|s| s.id != id).collect();
            let updates = ledger::plan_delete(&remaining, target.position);
            tx.apply_updates(&updates)?;
            Ok(Some(updates.len()))
        })?;

        let Some(shifted) = shifted else {
            return Ok(false);
        };

        debug!(scope = %scope, container_id, id, shifted, "Deleted sibling");
        self.events.emit(StorageEvent::SiblingDeleted {
            table: scope.table,
            container_id,
            id,
            shifted,
        });

        Ok(true)
    }

    /// Move a sibling so it ends at index `new_position` (clamped).
    ///
    /// Returns the final position.
    pub fn move_to(
        &self,
        scope: &SiblingScope,
        id: i64,
        new_position: i64,
    ) -> Result<i64, StorageError> {
        let container_id = self
            .store
            .container_of(scope, id)?
            .ok_or_else(|| StorageError::NotFound(format!("{} {}", scope.table, id)))?;

        let (final_position, updated) = self.store.with_container(scope, container_id, |tx| {
            let current = tx.current_positions()?;
            let moved = current
                .iter()
                .find(|s| s.id == id)
                .copied()
                .ok_or_else(|| StorageError::NotFound(format!("{} {}", scope.table, id)))?;
            let updates = ledger::plan_move(&current, moved.position, new_position)?;
            tx.apply_updates(&updates)?;
            let final_position = updates
                .last()
                .map(|u| u.position)
                .unwrap_or(moved.position);
            Ok((final_position, updates.len()))
        })?;

        if updated > 0 {
            self.events.emit(StorageEvent::SiblingsReordered {
                table: scope.table,
                container_id,
                updated,
            });
        }

        Ok(final_position)
    }

    /// Reassign every position from an ordered id list.
    ///
    /// The list must name exactly the container's current members.
    pub fn reorder(
        &self,
        scope: &SiblingScope,
        container_id: i64,
        ordered_ids: &[i64],
    ) -> Result<usize, StorageError> {
        let updated = self.store.with_container(scope, container_id, |tx| {
            let current = tx.current_positions()?;
            let updates = ledger::plan_bulk_reorder(&current, ordered_ids)?;
            tx.apply_updates(&updates)?;
            Ok(updates.len())
        })?;

        self.events.emit(StorageEvent::SiblingsReordered {
            table: scope.table,
            container_id,
            updated,
        });

        Ok(updated)
    }

    /// Close gaps and break ties left by writers that bypassed the ledger.
    pub fn normalize(&self, scope: &SiblingScope, container_id: i64) -> Result<usize, StorageError> {
        let updated = self.store.with_container(scope, container_id, |tx| {
            let current = tx.current_positions()?;
            let updates = ledger::plan_normalize(&current);
            tx.apply_updates(&updates)?;
            Ok(updates.len())
        })?;

        if updated > 0 {
            debug!(scope = %scope, container_id, updated, "Normalized sibling positions");
            self.events.emit(StorageEvent::SiblingsReordered {
                table: scope.table,
                container_id,
                updated,
            });
        }

        Ok(updated)
    }
}
