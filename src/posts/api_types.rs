//! Serde types matching the posts REST API.
//!
//! The server does not know about `date` or `reactions` unless a client sent
//! them, so both are optional here and filled in when converting to [`Post`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::SyncError;

use super::types::{NewPost, Post, PostId, PostPatch, ReactionCounts};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPost {
  #[serde(default)]
  pub id: Option<PostId>,
  #[serde(default, deserialize_with = "deserialize_user_id")]
  pub user_id: Option<u64>,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub body: String,
  #[serde(default)]
  pub date: Option<DateTime<Utc>>,
  #[serde(default)]
  pub reactions: Option<ReactionCounts>,
}

/// Forms echo `userId` back as a string; accept both shapes.
fn deserialize_user_id<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Raw {
    Number(u64),
    Text(String),
  }

  match Option::<Raw>::deserialize(deserializer)? {
    Some(Raw::Number(n)) => Ok(Some(n)),
    Some(Raw::Text(s)) => s
      .trim()
      .parse()
      .map(Some)
      .map_err(|_| serde::de::Error::custom(format!("invalid userId '{}'", s))),
    None => Ok(None),
  }
}

impl ApiPost {
  /// Convert into a store record.
  ///
  /// Fields the server left out come from `existing` when the post is already
  /// known locally, otherwise `date` falls back to `fallback_date` and every
  /// reaction starts at zero. A payload without an id is a `NotFound`.
  pub fn into_post(
    self,
    existing: Option<&Post>,
    fallback_date: DateTime<Utc>,
  ) -> Result<Post, SyncError> {
    let id = self
      .id
      .ok_or_else(|| SyncError::NotFound("post in response without an id".to_string()))?;

    let mut reactions = existing
      .map(|post| post.reactions.clone())
      .unwrap_or_else(ReactionCounts::zeroed);
    if let Some(server) = &self.reactions {
      reactions.merge(server);
    }

    Ok(Post {
      id,
      user_id: self
        .user_id
        .or(existing.map(|post| post.user_id))
        .unwrap_or_default(),
      title: self.title,
      body: self.body,
      date: self
        .date
        .or(existing.map(|post| post.date))
        .unwrap_or(fallback_date),
      reactions,
    })
  }
}

/// Write request handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum PostRequest {
  Create(NewPost),
  Patch { id: PostId, fields: PostPatch },
  Delete(PostId),
}

impl PostRequest {
  pub fn description(&self) -> String {
    match self {
      Self::Create(post) => format!("POST /posts ({})", post.title),
      Self::Patch { id, .. } => format!("PATCH /posts/{}", id),
      Self::Delete(id) => format!("DELETE /posts/{}", id),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::posts::types::ReactionKind;
  use chrono::TimeZone;

  fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
  }

  #[test]
  fn test_parses_server_shape() {
    let json = r#"{"userId": 1, "id": 3, "title": "ea molestias", "body": "et iusto"}"#;
    let post: ApiPost = serde_json::from_str(json).unwrap();
    assert_eq!(post.id, Some(PostId(3)));
    assert_eq!(post.user_id, Some(1));
    assert!(post.reactions.is_none());
  }

  #[test]
  fn test_string_user_id_is_numeric() {
    let json = r#"{"userId": "2", "id": 101, "title": "t", "body": "b"}"#;
    let post: ApiPost = serde_json::from_str(json).unwrap();
    assert_eq!(post.user_id, Some(2));
  }

  #[test]
  fn test_new_post_gets_defaults() {
    let api = ApiPost {
      id: Some(PostId(1)),
      user_id: Some(2),
      title: "t".into(),
      body: "b".into(),
      ..Default::default()
    };
    let post = api.into_post(None, at(5)).unwrap();
    assert_eq!(post.date, at(5));
    assert_eq!(post.reactions, ReactionCounts::zeroed());
  }

  #[test]
  fn test_known_post_keeps_local_fields() {
    let mut reactions = ReactionCounts::zeroed();
    reactions.set(ReactionKind::Rocket, 7);
    let existing = Post {
      id: PostId(1),
      user_id: 2,
      title: "old".into(),
      body: "old".into(),
      date: at(1),
      reactions,
    };
    let api = ApiPost {
      id: Some(PostId(1)),
      title: "new".into(),
      ..Default::default()
    };

    let post = api.into_post(Some(&existing), at(9)).unwrap();
    assert_eq!(post.title, "new");
    assert_eq!(post.user_id, 2);
    assert_eq!(post.date, at(1));
    assert_eq!(post.reactions.get(ReactionKind::Rocket), 7);
  }

  #[test]
  fn test_missing_id_is_not_found() {
    let err = ApiPost::default().into_post(None, at(0)).unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
  }
}
