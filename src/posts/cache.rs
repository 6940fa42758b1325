//! Cache wiring for posts: entity impl, query keys and invalidation table.

use sha2::{Digest, Sha256};
use std::cmp::Ordering;

use crate::cache::tags::{self, TagSet, TagTarget};
use crate::cache::{Entity, QueryKey};

use super::types::{NewPost, Post, PostId, PostPatch, ReactionKind};

pub const POST_TAG: &str = "Post";

// ============================================================================
// Entity implementation
// ============================================================================

impl Entity for Post {
  type Id = PostId;
  type Patch = PostPatch;

  fn id(&self) -> &PostId {
    &self.id
  }

  fn entity_type() -> &'static str {
    POST_TAG
  }

  fn merge(&mut self, incoming: Self) {
    self.user_id = incoming.user_id;
    self.title = incoming.title;
    self.body = incoming.body;
    self.date = incoming.date;
    self.reactions.merge(&incoming.reactions);
  }

  fn apply_patch(&mut self, patch: &PostPatch) -> PostPatch {
    let mut inverse = PostPatch::default();
    if let Some(title) = &patch.title {
      inverse.title = Some(std::mem::replace(&mut self.title, title.clone()));
    }
    if let Some(body) = &patch.body {
      inverse.body = Some(std::mem::replace(&mut self.body, body.clone()));
    }
    if let Some(user_id) = patch.user_id {
      inverse.user_id = Some(std::mem::replace(&mut self.user_id, user_id));
    }
    if let Some(date) = patch.date {
      inverse.date = Some(std::mem::replace(&mut self.date, date));
    }
    for (kind, count) in patch.reactions.iter() {
      let previous = self.reactions.set(kind, count);
      inverse.reactions.set(kind, previous);
    }
    inverse
  }
}

/// Newest first. The store breaks ties by insertion order.
pub fn by_date_desc(a: &Post, b: &Post) -> Ordering {
  b.date.cmp(&a.date)
}

// ============================================================================
// Query key types
// ============================================================================

/// Read queries against the posts API.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PostsQuery {
  /// Every post
  All,
  /// A single post
  ById(PostId),
  /// Posts written by one user
  ByUser(u64),
}

impl QueryKey for PostsQuery {
  fn cache_hash(&self) -> String {
    let input = match self {
      Self::All => "posts:all".to_string(),
      Self::ById(id) => format!("posts:id:{}", id),
      Self::ByUser(user_id) => format!("posts:user:{}", user_id),
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    match self {
      Self::All => "all posts".to_string(),
      Self::ById(id) => format!("post {}", id),
      Self::ByUser(user_id) => format!("posts by user {}", user_id),
    }
  }

  fn is_collection(&self) -> bool {
    !matches!(self, Self::ById(_))
  }
}

// ============================================================================
// Mutations and what they invalidate
// ============================================================================

/// Write operations the UI can issue.
#[derive(Clone, Debug, PartialEq)]
pub enum PostMutation {
  /// Confirmed-only: the server assigns the id, so the post appears in the
  /// store once the create succeeds, not when it is issued.
  Add(NewPost),
  Update { id: PostId, patch: PostPatch },
  Delete(PostId),
  AddReaction { id: PostId, kind: ReactionKind },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
  Add,
  Update,
  Delete,
  AddReaction,
}

impl MutationKind {
  pub const ALL: [MutationKind; 4] = [
    MutationKind::Add,
    MutationKind::Update,
    MutationKind::Delete,
    MutationKind::AddReaction,
  ];
}

/// Tags each mutation kind invalidates once the server confirms it.
pub const INVALIDATION_TABLE: &[(MutationKind, &[TagTarget])] = &[
  (MutationKind::Add, &[TagTarget::List]),
  (MutationKind::Update, &[TagTarget::Subject]),
  (MutationKind::Delete, &[TagTarget::Subject, TagTarget::List]),
  (MutationKind::AddReaction, &[TagTarget::Subject]),
];

impl PostMutation {
  pub fn kind(&self) -> MutationKind {
    match self {
      Self::Add(_) => MutationKind::Add,
      Self::Update { .. } => MutationKind::Update,
      Self::Delete(_) => MutationKind::Delete,
      Self::AddReaction { .. } => MutationKind::AddReaction,
    }
  }

  /// The existing post this mutation targets
  pub fn subject(&self) -> Option<PostId> {
    match self {
      Self::Add(_) => None,
      Self::Update { id, .. } | Self::Delete(id) | Self::AddReaction { id, .. } => Some(*id),
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::Add(post) => format!("add post '{}'", post.title),
      Self::Update { id, .. } => format!("update post {}", id),
      Self::Delete(id) => format!("delete post {}", id),
      Self::AddReaction { id, kind } => format!("add {} reaction to post {}", kind.name(), id),
    }
  }

  pub fn invalidated_tags(&self) -> TagSet {
    let kind = self.kind();
    let targets = INVALIDATION_TABLE
      .iter()
      .find(|(row, _)| *row == kind)
      .map(|(_, targets)| *targets)
      .unwrap_or(&[]);
    tags::resolve_targets(POST_TAG, targets, self.subject().as_ref())
  }
}
