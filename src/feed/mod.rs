//! Feed acquisition: fetching and parsing remote RSS/Atom documents,
//! deciding which parsed items are new or changed, and encoding/decoding
//! OPML subscription lists.
//!
//! - [`fetch`] - the feed parser capability: HTTP retrieval plus `feed-rs`
//!   parsing into [`ParsedFeed`] values
//! - [`diff`] - pure insert/update decision logic keyed by ExtID and
//!   resolved timestamps
//! - [`opml`] - OPML 2.0 payload encoding and decoding

pub mod diff;
pub mod fetch;
pub mod opml;

pub use fetch::{FeedFetcher, FetchError};

/// A feed document as returned by the parser capability.
///
/// Timestamps are Unix milliseconds UTC, matching the storage layer.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub updated: Option<i64>,
    pub items: Vec<ParsedItem>,
}

/// One item of a parsed feed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedItem {
    /// The source's own item identifier, or a content hash when absent.
    pub ext_id: String,
    pub title: String,
    pub url: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub published: Option<i64>,
    pub updated: Option<i64>,
}

impl ParsedItem {
    /// The item's effective update time: the explicit update time when
    /// present, else the published time.
    pub fn resolved_updated(&self) -> Option<i64> {
        self.updated.or(self.published)
    }

    /// The item's effective published time: the explicit published time when
    /// present, else the update time.
    pub fn resolved_published(&self) -> Option<i64> {
        self.published.or(self.updated)
    }
}

impl ParsedFeed {
    /// The feed's effective update time: the feed-level value when present,
    /// else the maximum of the items' resolved update times.
    pub fn resolved_updated(&self) -> Option<i64> {
        if self.updated.is_some() {
            return self.updated;
        }
        self.items.iter().filter_map(ParsedItem::resolved_updated).max()
    }
}
