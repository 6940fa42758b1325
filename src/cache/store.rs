//! Normalized, ordered entity store.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};

use super::traits::Entity;

/// Total order used to keep `ids` sorted.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Normalized state: ordered ids plus an id → record map.
///
/// `ids` and `by_id` always hold the same set of identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState<T: Entity> {
  ids: Vec<T::Id>,
  by_id: HashMap<T::Id, T>,
}

impl<T: Entity> Default for EntityState<T> {
  fn default() -> Self {
    Self {
      ids: Vec::new(),
      by_id: HashMap::new(),
    }
  }
}

impl<T: Entity> EntityState<T> {
  pub fn ids(&self) -> &[T::Id] {
    &self.ids
  }

  pub fn get(&self, id: &T::Id) -> Option<&T> {
    self.by_id.get(id)
  }

  pub fn contains(&self, id: &T::Id) -> bool {
    self.by_id.contains_key(id)
  }

  /// Records in sort order.
  pub fn iter(&self) -> impl Iterator<Item = &T> {
    self.ids.iter().filter_map(|id| self.by_id.get(id))
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }
}

/// Ordered, deduplicated collection of records keyed by identifier.
///
/// Every mutating operation ends with a full stable re-sort by the configured
/// comparator, ties broken by first-insertion order, and bumps `version`.
pub struct EntityStore<T: Entity> {
  state: EntityState<T>,
  /// First-insertion sequence number per id, used as the sort tie breaker
  inserted: HashMap<T::Id, u64>,
  next_seq: u64,
  version: u64,
  comparator: Comparator<T>,
}

impl<T: Entity> EntityStore<T> {
  /// Create an empty store ordered by `comparator`.
  pub fn new<F>(comparator: F) -> Self
  where
    F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
  {
    Self {
      state: EntityState::default(),
      inserted: HashMap::new(),
      next_seq: 0,
      version: 0,
      comparator: Arc::new(comparator),
    }
  }

  pub fn state(&self) -> &EntityState<T> {
    &self.state
  }

  /// Version stamp, incremented by every mutation.
  pub fn version(&self) -> u64 {
    self.version
  }

  pub fn ids(&self) -> &[T::Id] {
    self.state.ids()
  }

  pub fn get(&self, id: &T::Id) -> Option<&T> {
    self.state.get(id)
  }

  pub fn contains(&self, id: &T::Id) -> bool {
    self.state.contains(id)
  }

  pub fn iter(&self) -> impl Iterator<Item = &T> {
    self.state.iter()
  }

  /// Replace the whole contents.
  pub fn set_all(&mut self, records: impl IntoIterator<Item = T>) {
    self.state.ids.clear();
    self.state.by_id.clear();
    self.inserted.clear();
    for record in records {
      self.insert_or_replace(record);
    }
    self.resort();
  }

  /// Insert new records, merge the rest into their existing entry.
  pub fn upsert_many(&mut self, records: impl IntoIterator<Item = T>) {
    for record in records {
      match self.state.by_id.get_mut(record.id()) {
        Some(existing) => existing.merge(record),
        None => self.insert_or_replace(record),
      }
    }
    self.resort();
  }

  /// Add a record whose id must not exist yet.
  pub fn add_one(&mut self, record: T) -> SyncResult<()> {
    if self.state.contains(record.id()) {
      return Err(SyncError::DuplicateIdentifier(record.id().to_string()));
    }
    self.insert_or_replace(record);
    self.resort();
    Ok(())
  }

  /// Remove a record. Absent ids are a no-op.
  pub fn remove_one(&mut self, id: &T::Id) -> Option<T> {
    self.take(id).map(|(record, _)| record)
  }

  /// Apply a field-level patch, returning its inverse.
  pub fn update_fields(&mut self, id: &T::Id, patch: &T::Patch) -> SyncResult<T::Patch> {
    let record = self
      .state
      .by_id
      .get_mut(id)
      .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
    let inverse = record.apply_patch(patch);
    self.resort();
    Ok(inverse)
  }

  /// Copy of the records among `ids` that are still present, in store order.
  pub fn snapshot_of(&self, ids: &[T::Id]) -> EntityState<T> {
    let wanted: HashSet<&T::Id> = ids.iter().collect();
    let mut snapshot = EntityState::default();
    for id in self.state.ids.iter().filter(|id| wanted.contains(id)) {
      if let Some(record) = self.state.by_id.get(id) {
        snapshot.ids.push(id.clone());
        snapshot.by_id.insert(id.clone(), record.clone());
      }
    }
    snapshot
  }

  /// Remove a record and hand back its insertion sequence so a later
  /// [`restore`](Self::restore) puts it back in the same tie-break position.
  pub(crate) fn take(&mut self, id: &T::Id) -> Option<(T, u64)> {
    let record = self.state.by_id.remove(id)?;
    self.state.ids.retain(|existing| existing != id);
    let seq = self.inserted.remove(id).unwrap_or(self.next_seq);
    self.version += 1;
    Some((record, seq))
  }

  /// Put back a record removed by [`take`](Self::take). Returns false, and
  /// leaves the store alone, when the id has been re-added in the meantime.
  pub(crate) fn restore(&mut self, record: T, seq: u64) -> bool {
    if self.state.contains(record.id()) {
      return false;
    }
    let id = record.id().clone();
    self.inserted.insert(id.clone(), seq);
    self.state.ids.push(id.clone());
    self.state.by_id.insert(id, record);
    self.resort();
    true
  }

  fn insert_or_replace(&mut self, record: T) {
    let id = record.id().clone();
    if !self.inserted.contains_key(&id) {
      self.inserted.insert(id.clone(), self.next_seq);
      self.next_seq += 1;
    }
    if self.state.by_id.insert(id.clone(), record).is_none() {
      self.state.ids.push(id);
    }
  }

  fn resort(&mut self) {
    let EntityState { ids, by_id } = &mut self.state;
    let inserted = &self.inserted;
    let comparator = &self.comparator;
    ids.sort_by(|a, b| {
      let order = match (by_id.get(a), by_id.get(b)) {
        (Some(x), Some(y)) => comparator(x, y),
        _ => Ordering::Equal,
      };
      order.then_with(|| inserted.get(a).cmp(&inserted.get(b)))
    });
    self.version += 1;
  }
}

impl<T: Entity> fmt::Debug for EntityStore<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EntityStore")
      .field("state", &self.state)
      .field("version", &self.version)
      .finish_non_exhaustive()
  }
}
