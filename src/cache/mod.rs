//! Generic client-side cache for records served by a remote API.
//!
//! This module is independent of any particular record type. It provides:
//! - A normalized, sorted entity store with field-level patches
//! - A request cache that deduplicates in-flight fetches per query key
//! - Tags linking cached reads to the mutations that invalidate them
//! - Bookkeeping for optimistic mutations and their inverse edits

pub mod optimistic;
pub mod request_cache;
pub mod store;
pub mod tags;
pub mod traits;

pub use optimistic::{Inverse, PendingMutation, PendingMutations, SpeculativeEdit};
pub use request_cache::{CacheEntry, RequestCache, DEFAULT_RETENTION};
pub use store::{EntityState, EntityStore};
pub use tags::{Tag, TagId, TagSet, TagTarget};
pub use traits::{Entity, QueryKey};
