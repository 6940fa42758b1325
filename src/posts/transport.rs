//! Boundary to whatever issues the actual network calls.

use futures::future::BoxFuture;
use thiserror::Error;

use crate::error::SyncError;

use super::api_types::{ApiPost, PostRequest};
use super::cache::PostsQuery;

/// Failure reported by a transport, distinguishable from a success payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
  pub message: String,
}

impl TransportError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

impl From<TransportError> for SyncError {
  fn from(err: TransportError) -> Self {
    SyncError::NetworkFailure(err.message)
  }
}

pub type TransportFuture<T> = BoxFuture<'static, Result<T, TransportError>>;

/// Performs reads and writes against the remote posts service.
///
/// Both methods are called synchronously and must return a future that owns
/// everything it needs; the sync layer spawns it on the tokio runtime.
pub trait Transport: Send + Sync + 'static {
  /// Fetch the posts matching `query`. Single-post queries yield one element.
  fn fetch(&self, query: &PostsQuery) -> TransportFuture<Vec<ApiPost>>;

  /// Send a write. Returns the server's copy of the post when it sends one.
  fn send(&self, request: &PostRequest) -> TransportFuture<Option<ApiPost>>;
}
