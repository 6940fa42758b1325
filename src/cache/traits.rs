//! Core traits for the normalized cache.

use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Trait for records that can live in an [`EntityStore`](super::EntityStore).
///
/// Implementors provide a unique identifier, a tag discriminator, and the two
/// editing primitives the store and the optimistic controller are built on.
pub trait Entity: Clone + Debug + PartialEq + Send + Sync + 'static {
  type Id: Clone + Eq + Hash + Ord + Debug + Display + Send + Sync + 'static;

  /// Field-level edit. Every field is optional; `None` means "leave alone".
  type Patch: Clone + Debug + PartialEq + Send + Sync + 'static;

  /// Unique identifier for this record
  fn id(&self) -> &Self::Id;

  /// Entity type name used as the tag discriminator (e.g. "Post")
  fn entity_type() -> &'static str;

  /// Merge a freshly received copy of this record into `self`, keeping any
  /// field the incoming copy leaves unspecified.
  fn merge(&mut self, incoming: Self);

  /// Apply `patch` and return the patch that restores the previous values of
  /// exactly the fields `patch` touched.
  fn apply_patch(&mut self, patch: &Self::Patch) -> Self::Patch;
}

/// Canonical identity of a read query.
pub trait QueryKey: Clone + Debug + Send + Sync + 'static {
  /// Stable, fixed-length hash of the query arguments
  fn cache_hash(&self) -> String;

  /// Human readable description for logs
  fn description(&self) -> String;

  /// Whether the result depends on collection membership (provides a LIST tag)
  fn is_collection(&self) -> bool;
}
