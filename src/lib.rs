//! tidings: a feed aggregation service.
//!
//! Subscriptions live in a SQLite store; a concurrent puller keeps their
//! entries in sync with the upstream sources. The crate is organized in
//! three layers:
//!
//! - [`feed`]: fetching, parsing, entry diffing, and the OPML bridge
//! - [`storage`]: the transactional store and the pull engine
//! - [`service`]: the operation surface a transport maps onto

pub mod config;
pub mod feed;
pub mod service;
pub mod storage;
pub mod version;
