use thiserror::Error;

/// Errors surfaced by the store, the request cache and mutation handles.
///
/// Cloneable so one fetch failure can be handed to every subscriber of a query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
  #[error("record {0} already exists")]
  DuplicateIdentifier(String),

  #[error("record {0} not found")]
  NotFound(String),

  #[error("network failure: {0}")]
  NetworkFailure(String),

  /// Resolution of a fetch generation that has since been superseded.
  /// Only used internally, never handed to a caller.
  #[error("stale write for {key} (generation {generation})")]
  StaleWrite { key: String, generation: u64 },

  #[error("query {0} was evicted")]
  Evicted(String),

  #[error("mutation {0} was cancelled before it was sent")]
  Cancelled(u64),

  #[error("mutation {0} has already been sent")]
  NotCancelable(u64),
}

impl SyncError {
  pub fn is_network(&self) -> bool {
    matches!(self, SyncError::NetworkFailure(_))
  }
}

pub type SyncResult<T> = Result<T, SyncError>;
