//! Observable read handles.
//!
//! Inspired by TanStack Query: a [`ReadHandle`] is what a caller gets back from
//! `PostsSync::read`. It exposes the current status/data/error of the shared
//! cache entry, can be polled from an event loop tick or awaited, and releases
//! its subscription when dropped or cancelled.
//!
//! # Example
//!
//! ```ignore
//! let mut handle = sync.read(PostsQuery::All);
//!
//! // In event loop tick
//! if handle.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match handle.status() {
//!     QueryStatus::Pending => render_spinner(),
//!     QueryStatus::Resolved => render_posts(handle.data()),
//!     QueryStatus::Rejected => render_error(handle.error()),
//!     QueryStatus::Idle => {}
//! }
//! ```

use std::sync::Arc;
use tokio::sync::watch;

use crate::cache::{Entity, EntityState};
use crate::error::SyncError;

/// Lifecycle of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Created but no fetch issued yet
  Idle,
  /// A fetch is in flight
  Pending,
  /// Last fetch succeeded
  Resolved,
  /// Last fetch failed; previously resolved data may still be present
  Rejected,
}

impl QueryStatus {
  pub fn is_settled(self) -> bool {
    matches!(self, QueryStatus::Resolved | QueryStatus::Rejected)
  }
}

/// Point-in-time view of a cache entry, as published to its subscribers.
#[derive(Debug, Clone)]
pub struct QuerySnapshot<T: Entity> {
  pub status: QueryStatus,
  pub data: Option<Arc<EntityState<T>>>,
  pub error: Option<SyncError>,
  /// Invalidated since the last resolution
  pub stale: bool,
  /// Fetch generation the snapshot belongs to
  pub generation: u64,
}

impl<T: Entity> Default for QuerySnapshot<T> {
  fn default() -> Self {
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
      stale: false,
      generation: 0,
    }
  }
}

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Subscription to one cached query.
///
/// Dropping the handle (or calling [`cancel`](Self::cancel)) decrements the
/// entry's subscriber count. It never aborts a fetch other subscribers share.
pub struct ReadHandle<T: Entity> {
  description: String,
  receiver: watch::Receiver<QuerySnapshot<T>>,
  release: Option<Release>,
}

impl<T: Entity> ReadHandle<T> {
  pub(crate) fn new(
    description: String,
    receiver: watch::Receiver<QuerySnapshot<T>>,
    release: impl FnOnce() + Send + Sync + 'static,
  ) -> Self {
    Self {
      description,
      receiver,
      release: Some(Box::new(release)),
    }
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  /// Latest published snapshot.
  pub fn snapshot(&self) -> QuerySnapshot<T> {
    self.receiver.borrow().clone()
  }

  pub fn status(&self) -> QueryStatus {
    self.receiver.borrow().status
  }

  pub fn data(&self) -> Option<Arc<EntityState<T>>> {
    self.receiver.borrow().data.clone()
  }

  pub fn error(&self) -> Option<SyncError> {
    self.receiver.borrow().error.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.status() == QueryStatus::Pending
  }

  pub fn is_stale(&self) -> bool {
    self.receiver.borrow().stale
  }

  /// Returns `true` if the entry changed since the last poll.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    match self.receiver.has_changed() {
      Ok(true) => {
        self.receiver.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait for the next change. Returns `false` once the entry is gone.
  pub async fn changed(&mut self) -> bool {
    self.receiver.changed().await.is_ok()
  }

  /// Wait until the entry is resolved or rejected.
  ///
  /// A rejection is returned as the error even when older data is still
  /// available through [`data`](Self::data).
  pub async fn settled(&mut self) -> Result<Arc<EntityState<T>>, SyncError> {
    let snapshot = self
      .receiver
      .wait_for(|s| s.status.is_settled())
      .await
      .map_err(|_| SyncError::Evicted(self.description.clone()))?
      .clone();

    match (snapshot.status, snapshot.data, snapshot.error) {
      (QueryStatus::Rejected, _, Some(error)) => Err(error),
      (_, Some(data), _) => Ok(data),
      _ => Ok(Arc::new(EntityState::default())),
    }
  }

  /// Drop the subscription.
  pub fn cancel(self) {}
}

impl<T: Entity> Drop for ReadHandle<T> {
  fn drop(&mut self) {
    if let Some(release) = self.release.take() {
      release();
    }
  }
}

impl<T: Entity> std::fmt::Debug for ReadHandle<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ReadHandle")
      .field("description", &self.description)
      .field("status", &self.status())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::tests::{note, Note};
  use crate::cache::EntityStore;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn handle_with_counter() -> (
    watch::Sender<QuerySnapshot<Note>>,
    ReadHandle<Note>,
    Arc<AtomicUsize>,
  ) {
    let (tx, rx) = watch::channel(QuerySnapshot::default());
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    let handle = ReadHandle::new("notes".to_string(), rx, move || {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    (tx, handle, released)
  }

  #[tokio::test]
  async fn test_settled_returns_data() {
    let (tx, mut handle, _) = handle_with_counter();
    let mut store = EntityStore::new(|a: &Note, b: &Note| b.rank.cmp(&a.rank));
    store.set_all(vec![note(1, 1)]);

    tx.send_replace(QuerySnapshot {
      status: QueryStatus::Pending,
      ..Default::default()
    });
    assert!(handle.is_loading());

    let state = Arc::new(store.snapshot_of(&[1]));
    tx.send_replace(QuerySnapshot {
      status: QueryStatus::Resolved,
      data: Some(state.clone()),
      generation: 1,
      ..Default::default()
    });

    assert_eq!(handle.settled().await.unwrap(), state);
  }

  #[tokio::test]
  async fn test_settled_surfaces_rejection() {
    let (tx, mut handle, _) = handle_with_counter();
    tx.send_replace(QuerySnapshot {
      status: QueryStatus::Rejected,
      error: Some(SyncError::NetworkFailure("boom".into())),
      ..Default::default()
    });
    assert_eq!(
      handle.settled().await.unwrap_err(),
      SyncError::NetworkFailure("boom".into())
    );
  }

  #[tokio::test]
  async fn test_settled_after_sender_dropped() {
    let (tx, mut handle, _) = handle_with_counter();
    drop(tx);
    assert_eq!(
      handle.settled().await.unwrap_err(),
      SyncError::Evicted("notes".into())
    );
  }

  #[test]
  fn test_poll_reports_changes_once() {
    let (tx, mut handle, _) = handle_with_counter();
    assert!(!handle.poll());
    tx.send_replace(QuerySnapshot {
      status: QueryStatus::Pending,
      ..Default::default()
    });
    assert!(handle.poll());
    assert!(!handle.poll());
  }

  #[test]
  fn test_cancel_releases_once() {
    let (_tx, handle, released) = handle_with_counter();
    handle.cancel();
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }
}
