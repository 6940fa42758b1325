use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Post identifier as assigned by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub u64);

impl fmt::Display for PostId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReactionKind {
  ThumbsUp,
  Wow,
  Heart,
  Rocket,
  Coffee,
}

impl ReactionKind {
  pub const ALL: [ReactionKind; 5] = [
    ReactionKind::ThumbsUp,
    ReactionKind::Wow,
    ReactionKind::Heart,
    ReactionKind::Rocket,
    ReactionKind::Coffee,
  ];

  pub fn name(self) -> &'static str {
    match self {
      ReactionKind::ThumbsUp => "thumbsUp",
      ReactionKind::Wow => "wow",
      ReactionKind::Heart => "heart",
      ReactionKind::Rocket => "rocket",
      ReactionKind::Coffee => "coffee",
    }
  }

  pub fn emoji(self) -> &'static str {
    match self {
      ReactionKind::ThumbsUp => "👍",
      ReactionKind::Wow => "😮",
      ReactionKind::Heart => "❤️",
      ReactionKind::Rocket => "🚀",
      ReactionKind::Coffee => "☕",
    }
  }
}

impl FromStr for ReactionKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let wanted = s.trim().to_lowercase();
    Self::ALL
      .into_iter()
      .find(|kind| kind.name().to_lowercase() == wanted)
      .ok_or_else(|| format!("unknown reaction '{}'", s))
  }
}

/// Reaction counters. A kind missing from the map counts as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReactionCounts(BTreeMap<ReactionKind, u32>);

impl ReactionCounts {
  /// Every kind present, at zero
  pub fn zeroed() -> Self {
    Self(ReactionKind::ALL.into_iter().map(|kind| (kind, 0)).collect())
  }

  pub fn get(&self, kind: ReactionKind) -> u32 {
    self.0.get(&kind).copied().unwrap_or(0)
  }

  /// Set a counter, returning its previous value
  pub fn set(&mut self, kind: ReactionKind, count: u32) -> u32 {
    self.0.insert(kind, count).unwrap_or(0)
  }

  /// Overwrite the counters present in `other`, keep the rest
  pub fn merge(&mut self, other: &ReactionCounts) {
    for (kind, count) in other.iter() {
      self.0.insert(kind, count);
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = (ReactionKind, u32)> + '_ {
    self.0.iter().map(|(kind, count)| (*kind, *count))
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl FromIterator<(ReactionKind, u32)> for ReactionCounts {
  fn from_iter<I: IntoIterator<Item = (ReactionKind, u32)>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

/// A post as held in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
  pub id: PostId,
  pub user_id: u64,
  pub title: String,
  pub body: String,
  pub date: DateTime<Utc>,
  pub reactions: ReactionCounts,
}

/// Field-level edit of a post. `None` fields and absent reaction kinds are untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub body: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub user_id: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub date: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "ReactionCounts::is_empty")]
  pub reactions: ReactionCounts,
}

impl PostPatch {
  pub fn title(title: impl Into<String>) -> Self {
    Self {
      title: Some(title.into()),
      ..Default::default()
    }
  }

  pub fn reaction(kind: ReactionKind, count: u32) -> Self {
    Self {
      reactions: [(kind, count)].into_iter().collect(),
      ..Default::default()
    }
  }

  pub fn is_empty(&self) -> bool {
    self == &PostPatch::default()
  }
}

/// Payload for creating a post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPost {
  pub title: String,
  pub body: String,
  pub user_id: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_reaction_names_roundtrip_through_from_str() {
    for kind in ReactionKind::ALL {
      assert_eq!(kind.name().parse::<ReactionKind>(), Ok(kind));
    }
    assert_eq!("THUMBSUP".parse::<ReactionKind>(), Ok(ReactionKind::ThumbsUp));
    assert!("clap".parse::<ReactionKind>().is_err());
  }

  #[test]
  fn test_missing_reaction_counts_as_zero() {
    let mut counts = ReactionCounts::default();
    assert_eq!(counts.get(ReactionKind::Heart), 0);
    assert_eq!(counts.set(ReactionKind::Heart, 3), 0);
    assert_eq!(counts.get(ReactionKind::Heart), 3);
  }

  #[test]
  fn test_merge_keeps_unlisted_kinds() {
    let mut counts = ReactionCounts::zeroed();
    counts.set(ReactionKind::Wow, 4);
    counts.merge(&[(ReactionKind::Coffee, 2)].into_iter().collect());
    assert_eq!(counts.get(ReactionKind::Wow), 4);
    assert_eq!(counts.get(ReactionKind::Coffee), 2);
  }

  #[test]
  fn test_patch_serializes_only_set_fields() {
    let json = serde_json::to_value(PostPatch::reaction(ReactionKind::ThumbsUp, 1)).unwrap();
    assert_eq!(json, serde_json::json!({ "reactions": { "thumbsUp": 1 } }));
  }
}
