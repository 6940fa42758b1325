//! Scripted transport for exercising the sync layer without a network.

use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::posts::{ApiPost, PostId, PostRequest, PostsQuery, Transport, TransportError, TransportFuture};

type Reply<T> = Result<T, TransportError>;

enum Scripted<T> {
  Ready(Reply<T>),
  /// Resolved when the test sends through the paired `oneshot::Sender`
  Deferred(oneshot::Receiver<Reply<T>>),
}

impl<T: Send + 'static> Scripted<T> {
  fn into_reply(self) -> TransportFuture<T> {
    match self {
      Scripted::Ready(reply) => async move { reply }.boxed(),
      Scripted::Deferred(rx) => async move {
        rx.await
          .unwrap_or_else(|_| Err(TransportError::new("scripted reply dropped")))
      }
      .boxed(),
    }
  }
}

#[derive(Default)]
struct Script {
  fetches: HashMap<PostsQuery, VecDeque<Scripted<Vec<ApiPost>>>>,
  sends: VecDeque<Scripted<Option<ApiPost>>>,
  fetch_calls: Vec<PostsQuery>,
  send_calls: Vec<PostRequest>,
}

/// Replays queued replies in order and records every call it receives.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
  script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self::default()
  }

  fn script(&self) -> std::sync::MutexGuard<'_, Script> {
    self.script.lock().unwrap()
  }

  pub fn reply_fetch(&self, query: PostsQuery, reply: Reply<Vec<ApiPost>>) {
    self
      .script()
      .fetches
      .entry(query)
      .or_default()
      .push_back(Scripted::Ready(reply));
  }

  pub fn defer_fetch(&self, query: PostsQuery) -> oneshot::Sender<Reply<Vec<ApiPost>>> {
    let (tx, rx) = oneshot::channel();
    self
      .script()
      .fetches
      .entry(query)
      .or_default()
      .push_back(Scripted::Deferred(rx));
    tx
  }

  pub fn reply_send(&self, reply: Reply<Option<ApiPost>>) {
    self.script().sends.push_back(Scripted::Ready(reply));
  }

  pub fn defer_send(&self) -> oneshot::Sender<Reply<Option<ApiPost>>> {
    let (tx, rx) = oneshot::channel();
    self.script().sends.push_back(Scripted::Deferred(rx));
    tx
  }

  pub fn fetch_count(&self, query: &PostsQuery) -> usize {
    self
      .script()
      .fetch_calls
      .iter()
      .filter(|call| *call == query)
      .count()
  }

  pub fn send_calls(&self) -> Vec<PostRequest> {
    self.script().send_calls.clone()
  }
}

impl Transport for ScriptedTransport {
  fn fetch(&self, query: &PostsQuery) -> TransportFuture<Vec<ApiPost>> {
    let mut script = self.script();
    script.fetch_calls.push(query.clone());
    match script.fetches.get_mut(query).and_then(VecDeque::pop_front) {
      Some(reply) => reply.into_reply(),
      None => {
        let message = format!("no scripted reply for {:?}", query);
        async move { Err(TransportError::new(message)) }.boxed()
      }
    }
  }

  fn send(&self, request: &PostRequest) -> TransportFuture<Option<ApiPost>> {
    let mut script = self.script();
    script.send_calls.push(request.clone());
    match script.sends.pop_front() {
      Some(reply) => reply.into_reply(),
      None => {
        let message = format!("no scripted reply for {}", request.description());
        async move { Err(TransportError::new(message)) }.boxed()
      }
    }
  }
}

/// Server-shaped post without local fields
pub(crate) fn api_post(id: u64, user_id: u64) -> ApiPost {
  ApiPost {
    id: Some(PostId(id)),
    user_id: Some(user_id),
    title: format!("post {}", id),
    body: format!("body of post {}", id),
    date: None,
    reactions: None,
  }
}

pub(crate) fn network_down() -> TransportError {
  TransportError::new("connection refused")
}

/// Let spawned tasks run until they block.
pub(crate) async fn settle() {
  for _ in 0..16 {
    tokio::task::yield_now().await;
  }
}
