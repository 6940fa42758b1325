//! The only entry point the UI layer talks to.
//!
//! [`PostsSync`] owns the entity store, the request cache and the pending
//! mutation table behind one lock that is never held across an await. Reads
//! return observable [`ReadHandle`]s; writes apply their optimistic edit
//! synchronously and return a [`MutationHandle`] for the network outcome.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cache::optimistic::SpeculativeEdit;
use crate::cache::{
  EntityStore, Inverse, PendingMutations, QueryKey, RequestCache, DEFAULT_RETENTION,
};
use crate::error::{SyncError, SyncResult};
use crate::query::{QueryStatus, ReadHandle};

use super::api_types::{ApiPost, PostRequest};
use super::cache::{by_date_desc, PostMutation, PostsQuery};
use super::transport::{Transport, TransportError};
use super::types::{Post, PostId, PostPatch};

/// What a confirmed mutation produced
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  Created(Post),
  Updated(Post),
  Deleted(PostId),
}

struct State {
  store: EntityStore<Post>,
  cache: RequestCache<PostsQuery, Post>,
  pending: PendingMutations<Post>,
}

struct Shared {
  state: Mutex<State>,
  transport: Arc<dyn Transport>,
}

/// Synchronization context for posts.
///
/// Cheap to clone; every clone shares the same store and cache. Reads and
/// mutations spawn tokio tasks, so they must be issued from within a runtime.
#[derive(Clone)]
pub struct PostsSync {
  shared: Arc<Shared>,
}

impl PostsSync {
  pub fn new(transport: impl Transport) -> Self {
    Self::with_retention(transport, DEFAULT_RETENTION)
  }

  /// Create a context whose unsubscribed queries live for `retention`.
  pub fn with_retention(transport: impl Transport, retention: Duration) -> Self {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State {
          store: EntityStore::new(by_date_desc),
          cache: RequestCache::new(retention),
          pending: PendingMutations::new(),
        }),
        transport: Arc::new(transport),
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self
      .shared
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Subscribe to a query.
  ///
  /// Fresh cached data is available on the returned handle immediately.
  /// Otherwise a fetch is started, or joined if one is already in flight.
  /// Dropping the handle unsubscribes.
  pub fn read(&self, query: PostsQuery) -> ReadHandle<Post> {
    let hash = query.cache_hash();
    let subscription = {
      let mut state = self.lock();
      state.cache.evict_expired(Instant::now());
      state.cache.subscribe(&query)
    };

    if let Some(generation) = subscription.fetch {
      self.spawn_fetch(query.clone(), hash.clone(), generation);
    }

    let sync = self.clone();
    ReadHandle::new(query.description(), subscription.receiver, move || {
      sync.lock().cache.unsubscribe(&hash, Instant::now());
    })
  }

  fn spawn_fetch(&self, query: PostsQuery, hash: String, generation: u64) {
    let future = self.shared.transport.fetch(&query);
    let sync = self.clone();
    tokio::spawn(async move {
      let result = future.await;
      sync.finish_fetch(&query, &hash, generation, result);
    });
  }

  fn finish_fetch(
    &self,
    query: &PostsQuery,
    hash: &str,
    generation: u64,
    result: Result<Vec<ApiPost>, TransportError>,
  ) {
    let mut state = self.lock();
    if let Err(stale) = state.cache.check_generation(hash, generation) {
      debug!(query = %query.description(), error = %stale, "discarding superseded fetch");
      return;
    }

    let outcome = result
      .map_err(SyncError::from)
      .and_then(|posts| normalize(&state.store, posts));

    match outcome {
      Ok(posts) => {
        let ids: Vec<PostId> = posts.iter().map(|post| post.id).collect();
        state.store.upsert_many(posts);
        let State { store, cache, .. } = &mut *state;
        // Generation was checked above under the same lock
        let _ = cache.resolve(hash, generation, ids.clone(), store);
        cache.refresh_containing(&ids, store);
        debug!(query = %query.description(), count = ids.len(), "fetch resolved");
      }
      Err(error) => {
        warn!(query = %query.description(), %error, "fetch failed");
        let _ = state.cache.reject(hash, generation, error);
      }
    }
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  /// Issue a mutation.
  ///
  /// The optimistic edit is applied before this returns. Contract violations
  /// (`NotFound` for a missing target) are returned here, before any edit.
  /// The network call starts on the next scheduling point; until then the
  /// mutation can still be cancelled through its handle.
  pub fn mutate(&self, mutation: PostMutation) -> SyncResult<MutationHandle> {
    let (id, request) = {
      let mut state = self.lock();
      let (edit, request) = plan(&state.store, &mutation)?;
      let subject = edit.subject().copied();
      let inverse = edit.apply(&mut state.store)?;
      let State { store, cache, .. } = &mut *state;
      let affected = match subject {
        Some(subject) => cache.refresh_containing(&[subject], store),
        None => Vec::new(),
      };
      let id = state
        .pending
        .register(mutation.description(), inverse, affected);
      (id, request)
    };
    debug!(mutation = id, op = %mutation.description(), "optimistic edit applied");

    let (tx, rx) = oneshot::channel();
    let sync = self.clone();
    tokio::spawn(async move {
      let result = sync.run_mutation(id, mutation, request).await;
      let _ = tx.send(result);
    });

    Ok(MutationHandle {
      id,
      sync: self.clone(),
      receiver: rx,
    })
  }

  async fn run_mutation(
    &self,
    id: u64,
    mutation: PostMutation,
    request: PostRequest,
  ) -> SyncResult<MutationOutcome> {
    let future = {
      let mut state = self.lock();
      state.pending.mark_sent(id)?;
      self.shared.transport.send(&request)
    };
    debug!(mutation = id, request = %request.description(), "sent");

    let response = future.await;

    let (outcome, refetch) = {
      let mut state = self.lock();
      let committed = response
        .map_err(SyncError::from)
        .and_then(|payload| commit(&mut state, &mutation, payload));

      match committed {
        Ok(outcome) => {
          state.pending.settle(id);
          let refetch = invalidate(&mut state, &mutation);
          info!(mutation = id, op = %mutation.description(), "committed");
          (Ok(outcome), refetch)
        }
        Err(error) => {
          revert(&mut state, id);
          warn!(mutation = id, op = %mutation.description(), %error, "reverted");
          (Err(error), Vec::new())
        }
      }
    };

    for (query, hash, generation) in refetch {
      self.spawn_fetch(query, hash, generation);
    }
    outcome
  }

  fn cancel_mutation(&self, id: u64) -> SyncResult<()> {
    let mut state = self.lock();
    let mutation = state.pending.cancel(id)?;
    let State { store, cache, .. } = &mut *state;
    restore_readers(cache, store, mutation.inverse, &mutation.affected);
    info!(mutation = id, op = %mutation.description, "cancelled before send");
    Ok(())
  }

  // ==========================================================================
  // Selectors
  // ==========================================================================

  /// Every post, newest first
  pub fn select_all(&self) -> Vec<Post> {
    self.lock().store.iter().cloned().collect()
  }

  pub fn select_by_id(&self, id: PostId) -> Option<Post> {
    self.lock().store.get(&id).cloned()
  }

  pub fn select_ids(&self) -> Vec<PostId> {
    self.lock().store.ids().to_vec()
  }

  /// Posts written by `user_id`, newest first
  pub fn select_by_user(&self, user_id: u64) -> Vec<Post> {
    self
      .lock()
      .store
      .iter()
      .filter(|post| post.user_id == user_id)
      .cloned()
      .collect()
  }

  /// Store version stamp; changes whenever the store does
  pub fn version(&self) -> u64 {
    self.lock().store.version()
  }

  /// Status of a query's cache entry (`Idle` when there is none)
  pub fn query_status(&self, query: &PostsQuery) -> QueryStatus {
    self
      .lock()
      .cache
      .entry(&query.cache_hash())
      .map(|entry| entry.status())
      .unwrap_or(QueryStatus::Idle)
  }

  pub fn query_error(&self, query: &PostsQuery) -> Option<SyncError> {
    self
      .lock()
      .cache
      .entry(&query.cache_hash())
      .filter(|entry| entry.status() == QueryStatus::Rejected)
      .and_then(|entry| entry.error().cloned())
  }

  /// Whether a mutation invalidated the query since its last fetch
  pub fn is_stale(&self, query: &PostsQuery) -> bool {
    self
      .lock()
      .cache
      .entry(&query.cache_hash())
      .map(|entry| entry.is_stale())
      .unwrap_or(false)
  }

  pub fn subscriber_count(&self, query: &PostsQuery) -> usize {
    self
      .lock()
      .cache
      .entry(&query.cache_hash())
      .map(|entry| entry.subscribers())
      .unwrap_or(0)
  }

  pub fn pending_mutations(&self) -> usize {
    self.lock().pending.len()
  }

  /// Evict unsubscribed queries whose retention window elapsed.
  pub fn collect_garbage(&self) -> usize {
    self.lock().cache.evict_expired(Instant::now())
  }

  /// Drop every cached query. The store keeps its records.
  pub fn reset_cache(&self) {
    self.lock().cache.reset();
  }
}

/// Turn a fetched page into store records, keeping local-only fields of
/// posts already known. Posts without a server date are spaced a minute apart
/// in response order so the list keeps the server's ordering.
fn normalize(store: &EntityStore<Post>, posts: Vec<ApiPost>) -> SyncResult<Vec<Post>> {
  let now = Utc::now();
  posts
    .into_iter()
    .enumerate()
    .map(|(position, api)| {
      let existing = api.id.and_then(|id| store.get(&id));
      let fallback = now - ChronoDuration::minutes(position as i64 + 1);
      api.into_post(existing, fallback)
    })
    .collect()
}

/// Work out the optimistic edit and the wire request for a mutation.
fn plan(
  store: &EntityStore<Post>,
  mutation: &PostMutation,
) -> SyncResult<(SpeculativeEdit<Post>, PostRequest)> {
  let existing = |id: &PostId| {
    store
      .get(id)
      .ok_or_else(|| SyncError::NotFound(id.to_string()))
  };

  match mutation {
    PostMutation::Add(post) => Ok((SpeculativeEdit::None, PostRequest::Create(post.clone()))),
    PostMutation::Update { id, patch } => {
      existing(id)?;
      Ok((
        SpeculativeEdit::Patch {
          id: *id,
          patch: patch.clone(),
        },
        PostRequest::Patch {
          id: *id,
          fields: patch.clone(),
        },
      ))
    }
    PostMutation::Delete(id) => {
      existing(id)?;
      Ok((SpeculativeEdit::Remove(*id), PostRequest::Delete(*id)))
    }
    PostMutation::AddReaction { id, kind } => {
      let post = existing(id)?;
      let next = post.reactions.get(*kind).saturating_add(1);
      // The server stores the whole reactions map
      let mut reactions = post.reactions.clone();
      reactions.set(*kind, next);
      Ok((
        SpeculativeEdit::Patch {
          id: *id,
          patch: PostPatch::reaction(*kind, next),
        },
        PostRequest::Patch {
          id: *id,
          fields: PostPatch {
            reactions,
            ..Default::default()
          },
        },
      ))
    }
  }
}

/// Fold a confirmed server response into the store.
fn commit(
  state: &mut State,
  mutation: &PostMutation,
  payload: Option<ApiPost>,
) -> SyncResult<MutationOutcome> {
  let now = Utc::now();
  match mutation {
    PostMutation::Add(_) => {
      let created = payload
        .ok_or_else(|| SyncError::NotFound("created post missing from response".to_string()))?
        .into_post(None, now)?;
      state.store.add_one(created.clone())?;
      Ok(MutationOutcome::Created(created))
    }
    PostMutation::Update { id, .. } | PostMutation::AddReaction { id, .. } => {
      let api = payload.ok_or_else(|| SyncError::NotFound(id.to_string()))?;
      match api.id {
        Some(returned) if returned == *id => {}
        _ => return Err(SyncError::NotFound(id.to_string())),
      }
      let mut updated = api.into_post(state.store.get(id), now)?;
      if matches!(mutation, PostMutation::Update { .. }) {
        // Edited posts move to the top
        updated.date = now;
      }
      state.store.upsert_many([updated]);
      let updated = state
        .store
        .get(id)
        .cloned()
        .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
      let State { store, cache, .. } = state;
      cache.refresh_containing(&[*id], store);
      Ok(MutationOutcome::Updated(updated))
    }
    PostMutation::Delete(id) => Ok(MutationOutcome::Deleted(*id)),
  }
}

/// Apply the router's tags and start fetches for subscribed stale entries.
fn invalidate(state: &mut State, mutation: &PostMutation) -> Vec<(PostsQuery, String, u64)> {
  let tags = mutation.invalidated_tags();
  let hashes = state.cache.invalidate(&tags);
  hashes
    .into_iter()
    .filter_map(|hash| {
      let query = state.cache.entry(&hash)?.key().clone();
      let generation = state.cache.begin_fetch(&hash)?;
      Some((query, hash, generation))
    })
    .collect()
}

fn revert(state: &mut State, id: u64) {
  if let Some(mutation) = state.pending.settle(id) {
    let State { store, cache, .. } = state;
    restore_readers(cache, store, mutation.inverse, &mutation.affected);
  }
}

/// Undo a speculative edit and republish every entry that can see it,
/// including entries that resolved while the mutation was in flight.
fn restore_readers(
  cache: &mut RequestCache<PostsQuery, Post>,
  store: &mut EntityStore<Post>,
  inverse: Inverse<Post>,
  affected: &[String],
) {
  let touched = inverse.apply(store);
  cache.refresh(affected, store);
  cache.refresh_containing(&touched, store);
}

/// Awaitable outcome of a mutation.
#[derive(Debug)]
pub struct MutationHandle {
  id: u64,
  sync: PostsSync,
  receiver: oneshot::Receiver<SyncResult<MutationOutcome>>,
}

impl MutationHandle {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Void the optimistic edit if the network call has not started yet.
  ///
  /// Fails with `NotCancelable` once the request is in flight or settled.
  pub fn cancel(&self) -> SyncResult<()> {
    self.sync.cancel_mutation(self.id)
  }

  /// Wait for the server's verdict. A failure has already been reverted
  /// locally by the time it is returned.
  pub async fn wait(self) -> SyncResult<MutationOutcome> {
    match self.receiver.await {
      Ok(result) => result,
      Err(_) => Err(SyncError::Cancelled(self.id)),
    }
  }
}

impl std::fmt::Debug for PostsSync {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.lock();
    f.debug_struct("PostsSync")
      .field("posts", &state.store.ids().len())
      .field("queries", &state.cache.len())
      .field("pending", &state.pending.len())
      .finish()
  }
}
