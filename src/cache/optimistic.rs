//! Speculative edits and the table of mutations awaiting confirmation.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{SyncError, SyncResult};

use super::store::EntityStore;
use super::traits::Entity;

/// Local edit applied before the server confirms a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeculativeEdit<T: Entity> {
  /// Change some fields of an existing record
  Patch { id: T::Id, patch: T::Patch },
  /// Remove an existing record
  Remove(T::Id),
  /// Nothing to apply locally (e.g. a create whose id the server assigns)
  None,
}

impl<T: Entity> SpeculativeEdit<T> {
  /// Id of the record this edit targets, if any.
  pub fn subject(&self) -> Option<&T::Id> {
    match self {
      SpeculativeEdit::Patch { id, .. } | SpeculativeEdit::Remove(id) => Some(id),
      SpeculativeEdit::None => None,
    }
  }

  /// Apply to `store` and return the edit that undoes it.
  ///
  /// Fails with `NotFound` before touching the store if the target is absent.
  pub fn apply(self, store: &mut EntityStore<T>) -> SyncResult<Inverse<T>> {
    match self {
      SpeculativeEdit::Patch { id, patch } => {
        let inverse = store.update_fields(&id, &patch)?;
        Ok(Inverse::Patch { id, patch: inverse })
      }
      SpeculativeEdit::Remove(id) => {
        let (record, seq) = store
          .take(&id)
          .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        Ok(Inverse::Restore { record, seq })
      }
      SpeculativeEdit::None => Ok(Inverse::Noop),
    }
  }
}

/// Undo information for a speculative edit.
///
/// Patches restore only the fields the edit touched, so concurrent changes to
/// other fields of the same record survive a revert.
#[derive(Debug, Clone, PartialEq)]
pub enum Inverse<T: Entity> {
  Patch { id: T::Id, patch: T::Patch },
  Restore { record: T, seq: u64 },
  Noop,
}

impl<T: Entity> Inverse<T> {
  /// Apply relative to the current store state. Returns the ids it touched.
  pub fn apply(self, store: &mut EntityStore<T>) -> Vec<T::Id> {
    match self {
      Inverse::Patch { id, patch } => match store.update_fields(&id, &patch) {
        Ok(_) => vec![id],
        Err(_) => {
          debug!(%id, "record gone before revert, nothing to restore");
          Vec::new()
        }
      },
      Inverse::Restore { record, seq } => {
        let id = record.id().clone();
        if store.restore(record, seq) {
          vec![id]
        } else {
          debug!(%id, "record re-added before revert, keeping current copy");
          Vec::new()
        }
      }
      Inverse::Noop => Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
  /// Local edit applied, network call not started
  Queued,
  /// Network call in flight
  Sent,
}

#[derive(Debug)]
pub struct PendingMutation<T: Entity> {
  pub id: u64,
  pub description: String,
  pub inverse: Inverse<T>,
  /// Cache entries whose snapshot the speculative edit changed
  pub affected: Vec<String>,
  pub state: SendState,
}

/// Mutations between issuance and resolution.
#[derive(Debug)]
pub struct PendingMutations<T: Entity> {
  next_id: u64,
  pending: BTreeMap<u64, PendingMutation<T>>,
}

impl<T: Entity> Default for PendingMutations<T> {
  fn default() -> Self {
    Self {
      next_id: 1,
      pending: BTreeMap::new(),
    }
  }
}

impl<T: Entity> PendingMutations<T> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(
    &mut self,
    description: String,
    inverse: Inverse<T>,
    affected: Vec<String>,
  ) -> u64 {
    let id = self.next_id;
    self.next_id += 1;
    self.pending.insert(
      id,
      PendingMutation {
        id,
        description,
        inverse,
        affected,
        state: SendState::Queued,
      },
    );
    id
  }

  pub fn get(&self, id: u64) -> Option<&PendingMutation<T>> {
    self.pending.get(&id)
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  /// Flip a queued mutation to sent. Fails with `Cancelled` if it was
  /// cancelled in the meantime.
  pub fn mark_sent(&mut self, id: u64) -> SyncResult<()> {
    match self.pending.get_mut(&id) {
      Some(mutation) => {
        mutation.state = SendState::Sent;
        Ok(())
      }
      None => Err(SyncError::Cancelled(id)),
    }
  }

  /// Remove a queued mutation so its edit can be voided.
  pub fn cancel(&mut self, id: u64) -> SyncResult<PendingMutation<T>> {
    match self.pending.get(&id).map(|m| m.state) {
      Some(SendState::Queued) => self.pending.remove(&id).ok_or(SyncError::NotCancelable(id)),
      _ => Err(SyncError::NotCancelable(id)),
    }
  }

  /// Remove a mutation once its network call resolved.
  pub fn settle(&mut self, id: u64) -> Option<PendingMutation<T>> {
    self.pending.remove(&id)
  }
}
