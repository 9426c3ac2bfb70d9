//! SQLite-backed feed store.
//!
//! [`Database`] is the single entry point: CRUD over feeds and entries,
//! the OPML bridge, and the concurrent puller all hang off it. Writes go
//! through one transaction at a time, serialized by a store-wide lock.

mod entries;
mod feeds;
mod pull;
mod schema;
mod types;

pub use pull::{PullError, PullResult};
pub use schema::Database;
pub use types::{Entry, EntryEditOp, Feed, FeedEditOp, NewFeed, Stats, StoreError};
