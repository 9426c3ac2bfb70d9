use std::time::Duration;

use feed_rs::parser;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{ParsedFeed, ParsedItem};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_BODY: usize = 10 * 1024 * 1024; // 10MB

/// Errors surfaced by the feed parser capability.
///
/// All of these are per-feed faults: during a pull they become `Failure`
/// results for that feed only and never abort the batch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the fetch timeout
    #[error("request timed out")]
    Timeout,
    /// Response body exceeded the size limit
    #[error("response too large")]
    ResponseTooLarge,
    /// Document could not be parsed as RSS or Atom
    #[error("parse error: {0}")]
    Parse(String),
}

/// The feed parser capability: fetches a URL and parses the document into a
/// [`ParsedFeed`].
///
/// Holds a shared `reqwest::Client`; clone-free sharing happens through an
/// `Arc` at the call sites.
#[derive(Debug)]
pub struct FeedFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_body: usize,
}

impl Default for FeedFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_MAX_BODY)
    }
}

impl FeedFetcher {
    pub fn new(timeout: Duration, max_body: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
            max_body,
        }
    }

    /// Fetch and parse one feed document.
    pub async fn fetch(&self, url: &str) -> Result<ParsedFeed, FetchError> {
        let response = tokio::time::timeout(self.timeout, self.client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let bytes = read_limited_bytes(response, self.max_body).await?;
        parse_feed(&bytes)
    }
}

/// Parse raw feed bytes into the structured document the store consumes.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, FetchError> {
    let feed = parser::parse(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

    let site_url = feed.links.first().map(|l| l.href.clone());
    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let url = entry.links.first().map(|l| l.href.clone());
            let published = entry.published.map(|dt| dt.timestamp_millis());
            let updated = entry.updated.map(|dt| dt.timestamp_millis());
            let description = entry.summary.map(|s| s.content);
            let content = entry.content.and_then(|c| c.body);
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let ext_id = resolve_ext_id(existing_id, url.as_deref(), &title, published);

            ParsedItem {
                ext_id,
                title,
                url,
                description,
                content,
                published,
                updated,
            }
        })
        .collect();

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content),
        description: feed.description.map(|d| d.content),
        site_url,
        updated: feed.updated.map(|dt| dt.timestamp_millis()),
        items,
    })
}

/// Use the source's own identifier when it has one; otherwise derive a
/// stable ExtID by hashing the item's identity-ish fields.
fn resolve_ext_id(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(ext_id) = existing {
        let trimmed = ext_id.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: trust Content-Length when the server sends one.
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
