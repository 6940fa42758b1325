//! Memoized read results with request deduplication and tag tracking.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::query::{QuerySnapshot, QueryStatus};

use super::store::{EntityState, EntityStore};
use super::tags::{self, TagSet};
use super::traits::{Entity, QueryKey};

/// Default time an unsubscribed entry is kept around for quick re-subscription.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

/// One memoized query.
pub struct CacheEntry<K, T: Entity> {
  key: K,
  status: QueryStatus,
  /// Ids the last successful fetch returned, in response order
  result_ids: Option<Vec<T::Id>>,
  data: Option<Arc<EntityState<T>>>,
  error: Option<SyncError>,
  tags: TagSet,
  subscribers: usize,
  stale: bool,
  /// Generation of the latest fetch issued; only that one may resolve
  generation: u64,
  idle_since: Option<Instant>,
  tx: watch::Sender<QuerySnapshot<T>>,
}

impl<K: QueryKey, T: Entity> CacheEntry<K, T> {
  fn new(key: K) -> Self {
    let (tx, _) = watch::channel(QuerySnapshot::default());
    Self {
      key,
      status: QueryStatus::Idle,
      result_ids: None,
      data: None,
      error: None,
      tags: TagSet::new(),
      subscribers: 0,
      stale: false,
      generation: 0,
      idle_since: None,
      tx,
    }
  }

  pub fn key(&self) -> &K {
    &self.key
  }

  pub fn status(&self) -> QueryStatus {
    self.status
  }

  pub fn data(&self) -> Option<&Arc<EntityState<T>>> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&SyncError> {
    self.error.as_ref()
  }

  pub fn tags(&self) -> &TagSet {
    &self.tags
  }

  pub fn subscribers(&self) -> usize {
    self.subscribers
  }

  pub fn is_stale(&self) -> bool {
    self.stale
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  fn contains_any(&self, ids: &[T::Id]) -> bool {
    self
      .result_ids
      .as_ref()
      .is_some_and(|result| result.iter().any(|id| ids.contains(id)))
  }

  fn snapshot(&self) -> QuerySnapshot<T> {
    QuerySnapshot {
      status: self.status,
      data: self.data.clone(),
      error: self.error.clone(),
      stale: self.stale,
      generation: self.generation,
    }
  }

  fn publish(&self) {
    self.tx.send_replace(self.snapshot());
  }
}

/// Outcome of subscribing to a query.
pub struct Subscription<T: Entity> {
  pub receiver: watch::Receiver<QuerySnapshot<T>>,
  /// Generation of the fetch the caller must start, if any
  pub fetch: Option<u64>,
}

/// Table of cache entries keyed by the query's canonical hash.
pub struct RequestCache<K, T: Entity> {
  entries: BTreeMap<String, CacheEntry<K, T>>,
  retention: Duration,
  /// Last generation handed out. Never reset, so a fetch issued for an
  /// evicted entry cannot match the generation of its replacement.
  last_generation: u64,
}

impl<K: QueryKey, T: Entity> RequestCache<K, T> {
  pub fn new(retention: Duration) -> Self {
    Self {
      entries: BTreeMap::new(),
      retention,
      last_generation: 0,
    }
  }

  pub fn retention(&self) -> Duration {
    self.retention
  }

  pub fn entry(&self, hash: &str) -> Option<&CacheEntry<K, T>> {
    self.entries.get(hash)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Subscribe to `key`, creating the entry on first use.
  ///
  /// Fresh resolved data is served as is. A pending entry is shared. Anything
  /// else starts a new fetch generation the caller has to run.
  pub fn subscribe(&mut self, key: &K) -> Subscription<T> {
    let hash = key.cache_hash();
    let entry = self
      .entries
      .entry(hash.clone())
      .or_insert_with(|| CacheEntry::new(key.clone()));
    entry.subscribers += 1;
    entry.idle_since = None;
    let (status, stale) = (entry.status, entry.stale);

    let fetch = match status {
      QueryStatus::Resolved if !stale => {
        debug!(query = %key.description(), "cache hit");
        None
      }
      QueryStatus::Pending => {
        debug!(query = %key.description(), "joining in-flight fetch");
        None
      }
      _ => self.begin_fetch(&hash),
    };

    let receiver = match self.entries.get(&hash) {
      Some(entry) => entry.tx.subscribe(),
      None => watch::channel(QuerySnapshot::default()).1,
    };
    Subscription { receiver, fetch }
  }

  /// Decrement the subscriber count. At zero the entry starts its retention window.
  pub fn unsubscribe(&mut self, hash: &str, now: Instant) {
    if let Some(entry) = self.entries.get_mut(hash) {
      entry.subscribers = entry.subscribers.saturating_sub(1);
      if entry.subscribers == 0 {
        entry.idle_since = Some(now);
      }
    }
  }

  /// Start a new fetch generation for an existing entry.
  pub fn begin_fetch(&mut self, hash: &str) -> Option<u64> {
    let entry = self.entries.get_mut(hash)?;
    self.last_generation += 1;
    entry.generation = self.last_generation;
    entry.status = QueryStatus::Pending;
    entry.publish();
    debug!(query = %entry.key.description(), generation = entry.generation, "fetch issued");
    Some(entry.generation)
  }

  /// Fails with `StaleWrite` unless `generation` is the entry's latest fetch.
  pub fn check_generation(&self, hash: &str, generation: u64) -> SyncResult<()> {
    match self.entries.get(hash) {
      Some(entry) if entry.generation == generation => Ok(()),
      _ => Err(SyncError::StaleWrite {
        key: hash.to_string(),
        generation,
      }),
    }
  }

  /// Record a successful fetch. The records must already be in `store`.
  pub fn resolve(
    &mut self,
    hash: &str,
    generation: u64,
    ids: Vec<T::Id>,
    store: &EntityStore<T>,
  ) -> SyncResult<()> {
    self.check_generation(hash, generation)?;
    let Some(entry) = self.entries.get_mut(hash) else {
      return Ok(());
    };
    entry.tags = tags::provided_tags(T::entity_type(), &ids, entry.key.is_collection());
    entry.data = Some(Arc::new(store.snapshot_of(&ids)));
    entry.result_ids = Some(ids);
    entry.status = QueryStatus::Resolved;
    entry.error = None;
    entry.stale = false;
    entry.publish();
    Ok(())
  }

  /// Record a failed fetch, keeping previously resolved data for display.
  pub fn reject(&mut self, hash: &str, generation: u64, error: SyncError) -> SyncResult<()> {
    self.check_generation(hash, generation)?;
    if let Some(entry) = self.entries.get_mut(hash) {
      entry.status = QueryStatus::Rejected;
      entry.error = Some(error);
      entry.publish();
    }
    Ok(())
  }

  /// Mark every entry depending on `invalidated` stale.
  ///
  /// Returns the hashes of the stale entries that still have subscribers and
  /// must be refetched, in table order.
  pub fn invalidate(&mut self, invalidated: &TagSet) -> Vec<String> {
    let mut refetch = Vec::new();
    for (hash, entry) in self.entries.iter_mut() {
      if !tags::intersects(&entry.tags, invalidated) {
        continue;
      }
      entry.stale = true;
      entry.publish();
      debug!(query = %entry.key.description(), subscribers = entry.subscribers, "invalidated");
      if entry.subscribers > 0 {
        refetch.push(hash.clone());
      }
    }
    refetch
  }

  /// Rebuild the data snapshot of every entry whose result contains one of
  /// `ids`. Returns the hashes that were touched.
  pub fn refresh_containing(&mut self, ids: &[T::Id], store: &EntityStore<T>) -> Vec<String> {
    let hashes: Vec<String> = self
      .entries
      .iter()
      .filter(|(_, entry)| entry.contains_any(ids))
      .map(|(hash, _)| hash.clone())
      .collect();
    self.refresh(&hashes, store);
    hashes
  }

  /// Rebuild the data snapshot of the given entries from the store.
  pub fn refresh(&mut self, hashes: &[String], store: &EntityStore<T>) {
    for hash in hashes {
      if let Some(entry) = self.entries.get_mut(hash) {
        if let Some(ids) = &entry.result_ids {
          entry.data = Some(Arc::new(store.snapshot_of(ids)));
          entry.publish();
        }
      }
    }
  }

  /// Drop unsubscribed entries whose retention window has elapsed.
  pub fn evict_expired(&mut self, now: Instant) -> usize {
    let retention = self.retention;
    let before = self.entries.len();
    self.entries.retain(|_, entry| match entry.idle_since {
      Some(since) if entry.subscribers == 0 => now.duration_since(since) < retention,
      _ => true,
    });
    let evicted = before - self.entries.len();
    if evicted > 0 {
      debug!(evicted, "evicted idle cache entries");
    }
    evicted
  }

  /// Drop every entry. Open handles see their entry as evicted.
  pub fn reset(&mut self) {
    self.entries.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::tests::{note, Note, NotePatch};
  use crate::cache::tags::Tag;

  #[derive(Debug, Clone)]
  enum NotesQuery {
    All,
    One(u32),
  }

  impl QueryKey for NotesQuery {
    fn cache_hash(&self) -> String {
      match self {
        Self::All => "all".to_string(),
        Self::One(id) => format!("one:{}", id),
      }
    }

    fn description(&self) -> String {
      self.cache_hash()
    }

    fn is_collection(&self) -> bool {
      matches!(self, Self::All)
    }
  }

  fn store() -> EntityStore<Note> {
    let mut store = EntityStore::new(|a: &Note, b: &Note| b.rank.cmp(&a.rank));
    store.set_all(vec![note(1, 1), note(2, 2), note(3, 3)]);
    store
  }

  fn resolved(cache: &mut RequestCache<NotesQuery, Note>, key: NotesQuery, ids: Vec<u32>) {
    let store = store();
    let sub = cache.subscribe(&key);
    let generation = sub.fetch.unwrap();
    cache.resolve(&key.cache_hash(), generation, ids, &store).unwrap();
  }

  #[test]
  fn test_first_subscription_requests_fetch() {
    let mut cache = RequestCache::<NotesQuery, Note>::new(DEFAULT_RETENTION);
    let sub = cache.subscribe(&NotesQuery::All);
    assert_eq!(sub.fetch, Some(1));
    assert_eq!(sub.receiver.borrow().status, QueryStatus::Pending);
  }

  #[test]
  fn test_pending_entry_is_shared() {
    let mut cache = RequestCache::<NotesQuery, Note>::new(DEFAULT_RETENTION);
    let first = cache.subscribe(&NotesQuery::All);
    let second = cache.subscribe(&NotesQuery::All);
    assert_eq!(first.fetch, Some(1));
    assert_eq!(second.fetch, None);
    assert_eq!(cache.entry("all").unwrap().subscribers(), 2);
  }

  #[test]
  fn test_fresh_hit_serves_without_fetch() {
    let mut cache = RequestCache::<NotesQuery, Note>::new(DEFAULT_RETENTION);
    resolved(&mut cache, NotesQuery::All, vec![1, 2, 3]);
    let sub = cache.subscribe(&NotesQuery::All);
    assert_eq!(sub.fetch, None);
    let snapshot = sub.receiver.borrow().clone();
    assert_eq!(snapshot.status, QueryStatus::Resolved);
    assert_eq!(snapshot.data.unwrap().ids(), &[3, 2, 1]);
  }

  #[test]
  fn test_resolution_provides_tags() {
    let mut cache = RequestCache::<NotesQuery, Note>::new(DEFAULT_RETENTION);
    resolved(&mut cache, NotesQuery::All, vec![1, 2]);
    resolved(&mut cache, NotesQuery::One(3), vec![3]);

    let all: Vec<_> = cache.entry("all").unwrap().tags().iter().cloned().collect();
    assert_eq!(all, vec![Tag::id("Note", 1), Tag::id("Note", 2), Tag::list("Note")]);
    let one: Vec<_> = cache.entry("one:3").unwrap().tags().iter().cloned().collect();
    assert_eq!(one, vec![Tag::id("Note", 3)]);
  }

  #[test]
  fn test_superseded_generation_is_discarded() {
    let mut cache = RequestCache::<NotesQuery, Note>::new(DEFAULT_RETENTION);
    let store = store();
    let first = cache.subscribe(&NotesQuery::All).fetch.unwrap();
    let second = cache.begin_fetch("all").unwrap();

    cache.resolve("all", second, vec![2], &store).unwrap();
    let err = cache.resolve("all", first, vec![1], &store).unwrap_err();
    assert!(matches!(err, SyncError::StaleWrite { generation: 1, .. }));
    assert_eq!(cache.entry("all").unwrap().data().unwrap().ids(), &[2]);
  }

  #[test]
  fn test_reject_keeps_previous_data() {
    let mut cache = RequestCache::<NotesQuery, Note>::new(DEFAULT_RETENTION);
    resolved(&mut cache, NotesQuery::All, vec![1]);
    let generation = cache.begin_fetch("all").unwrap();
    cache
      .reject("all", generation, SyncError::NetworkFailure("down".into()))
      .unwrap();

    let entry = cache.entry("all").unwrap();
    assert_eq!(entry.status(), QueryStatus::Rejected);
    assert_eq!(entry.data().unwrap().ids(), &[1]);
  }

  #[test]
  fn test_invalidate_marks_stale_and_refetches_subscribed_only() {
    let mut cache = RequestCache::<NotesQuery, Note>::new(DEFAULT_RETENTION);
    resolved(&mut cache, NotesQuery::All, vec![1, 2]);
    resolved(&mut cache, NotesQuery::One(2), vec![2]);
    resolved(&mut cache, NotesQuery::One(3), vec![3]);
    cache.unsubscribe("one:2", Instant::now());

    let invalidated: TagSet = [Tag::id("Note", 2)].into_iter().collect();
    let refetch = cache.invalidate(&invalidated);

    assert_eq!(refetch, vec!["all".to_string()]);
    assert!(cache.entry("all").unwrap().is_stale());
    assert!(cache.entry("one:2").unwrap().is_stale());
    assert!(!cache.entry("one:3").unwrap().is_stale());
  }

  #[test]
  fn test_stale_entry_refetches_on_subscribe() {
    let mut cache = RequestCache::<NotesQuery, Note>::new(DEFAULT_RETENTION);
    resolved(&mut cache, NotesQuery::One(1), vec![1]);
    cache.invalidate(&[Tag::id("Note", 1)].into_iter().collect());
    assert_eq!(cache.subscribe(&NotesQuery::One(1)).fetch, Some(2));
  }

  #[test]
  fn test_refresh_containing_follows_store() {
    let mut cache = RequestCache::<NotesQuery, Note>::new(DEFAULT_RETENTION);
    resolved(&mut cache, NotesQuery::All, vec![1, 2, 3]);
    resolved(&mut cache, NotesQuery::One(3), vec![3]);

    let mut store = store();
    store
      .update_fields(&1, &NotePatch { rank: Some(9), text: None })
      .unwrap();
    let touched = cache.refresh_containing(&[1], &store);

    assert_eq!(touched, vec!["all".to_string()]);
    assert_eq!(cache.entry("all").unwrap().data().unwrap().ids(), &[1, 3, 2]);
  }

  #[test]
  fn test_recreated_entry_rejects_fetch_issued_before_eviction() {
    let mut cache = RequestCache::<NotesQuery, Note>::new(Duration::ZERO);
    let store = store();
    let old = cache.subscribe(&NotesQuery::All).fetch.unwrap();
    let now = Instant::now();
    cache.unsubscribe("all", now);
    assert_eq!(cache.evict_expired(now), 1);

    let new = cache.subscribe(&NotesQuery::All).fetch.unwrap();
    assert!(new > old);
    cache.resolve("all", new, vec![2], &store).unwrap();
    assert!(matches!(
      cache.resolve("all", old, vec![1], &store),
      Err(SyncError::StaleWrite { .. })
    ));
    assert_eq!(cache.entry("all").unwrap().data().unwrap().ids(), &[2]);
  }

  #[test]
  fn test_generations_keep_increasing_across_reset() {
    let mut cache = RequestCache::<NotesQuery, Note>::new(DEFAULT_RETENTION);
    let before = cache.subscribe(&NotesQuery::One(1)).fetch.unwrap();
    cache.reset();
    let after = cache.subscribe(&NotesQuery::One(1)).fetch.unwrap();
    assert!(cache.check_generation("one:1", before).is_err());
    assert!(cache.check_generation("one:1", after).is_ok());
  }

  #[test]
  fn test_eviction_waits_for_retention() {
    let mut cache = RequestCache::<NotesQuery, Note>::new(Duration::from_secs(30));
    resolved(&mut cache, NotesQuery::All, vec![1]);
    let now = Instant::now();
    cache.unsubscribe("all", now);

    assert_eq!(cache.evict_expired(now + Duration::from_secs(10)), 0);
    // Re-subscribing inside the window keeps the entry and its data
    assert_eq!(cache.subscribe(&NotesQuery::All).fetch, None);
    cache.unsubscribe("all", now);
    assert_eq!(cache.evict_expired(now + Duration::from_secs(31)), 1);
    assert!(cache.is_empty());
  }
}
