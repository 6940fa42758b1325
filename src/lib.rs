//! postsync
//!
//! Client-side synchronization layer for a remote collection of posts.
//!
//! - **cache**: generic building blocks (entity store, request cache, tags, optimistic edits)
//! - **query**: observable read handles
//! - **posts**: the post record, its REST transport and the [`PostsSync`] facade
//! - **config**: YAML configuration for the CLI

pub mod cache;
pub mod config;
pub mod error;
pub mod posts;
pub mod query;

#[cfg(test)]
mod testing;

pub use error::{SyncError, SyncResult};
pub use posts::PostsSync;
pub use query::{QuerySnapshot, QueryStatus, ReadHandle};
