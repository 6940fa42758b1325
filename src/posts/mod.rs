//! Posts: the record type, its REST transport and the synchronization facade.

pub mod api_types;
pub mod cache;
pub mod client;
pub mod sync;
pub mod transport;
pub mod types;

pub use api_types::{ApiPost, PostRequest};
pub use cache::{MutationKind, PostMutation, PostsQuery, INVALIDATION_TABLE};
pub use client::HttpTransport;
pub use sync::{MutationHandle, MutationOutcome, PostsSync};
pub use transport::{Transport, TransportError, TransportFuture};
pub use types::{NewPost, Post, PostId, PostPatch, ReactionCounts, ReactionKind};
