//! Dependency tags shared by cached reads and mutations.

use std::collections::BTreeSet;
use std::fmt;

/// Identity part of a tag: one record, or the membership of the whole collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagId {
  Id(String),
  List,
}

/// `(type, id)` dependency label. Two tags intersect only on exact equality,
/// so a `List` tag never matches a specific-id tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
  pub kind: &'static str,
  pub id: TagId,
}

impl Tag {
  pub fn id(kind: &'static str, id: impl ToString) -> Self {
    Self {
      kind,
      id: TagId::Id(id.to_string()),
    }
  }

  pub fn list(kind: &'static str) -> Self {
    Self {
      kind,
      id: TagId::List,
    }
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.id {
      TagId::Id(id) => write!(f, "{}:{}", self.kind, id),
      TagId::List => write!(f, "{}:LIST", self.kind),
    }
  }
}

pub type TagSet = BTreeSet<Tag>;

/// What a mutation invalidates, relative to the record it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagTarget {
  /// The record the mutation is about
  Subject,
  /// The collection as a whole
  List,
}

/// Resolve a row of an invalidation table into concrete tags.
///
/// `Subject` is skipped when the mutation has no subject id yet (e.g. a create).
pub fn resolve_targets<I: ToString>(
  kind: &'static str,
  targets: &[TagTarget],
  subject: Option<&I>,
) -> TagSet {
  targets
    .iter()
    .filter_map(|target| match target {
      TagTarget::Subject => subject.map(|id| Tag::id(kind, id.to_string())),
      TagTarget::List => Some(Tag::list(kind)),
    })
    .collect()
}

/// Tags a resolved read provides: one per returned id, plus `List` for
/// collection queries.
pub fn provided_tags<'a, I: ToString + 'a>(
  kind: &'static str,
  ids: impl IntoIterator<Item = &'a I>,
  collection: bool,
) -> TagSet {
  let mut tags: TagSet = ids.into_iter().map(|id| Tag::id(kind, id.to_string())).collect();
  if collection {
    tags.insert(Tag::list(kind));
  }
  tags
}

pub fn intersects(a: &TagSet, b: &TagSet) -> bool {
  a.iter().any(|tag| b.contains(tag))
}
