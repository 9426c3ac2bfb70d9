use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

/// Maximum allowed nesting depth for OPML outline elements. Guards against
/// stack-abuse payloads with pathological nesting.
const MAX_OPML_DEPTH: usize = 50;

/// Default document title used by export when no override is given.
const DEFAULT_EXPORT_TITLE: &str = "tidings feed subscriptions";

/// Errors produced while decoding or encoding OPML payloads.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// Outline nesting exceeds the safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// The payload is not a well-formed OPML document.
    #[error("malformed OPML document: {0}")]
    Malformed(String),

    /// Writing the export payload failed.
    #[error("failed to encode OPML document: {0}")]
    Encode(String),
}

/// One feed subscription extracted from (or destined for) an `<outline>`
/// element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outline {
    /// Display title: `title` attribute, falling back to `text`, then to the
    /// feed URL itself.
    pub title: String,
    /// URL of the feed document (`xmlUrl`).
    pub xml_url: String,
    /// URL of the feed's website (`htmlUrl`), if present.
    pub html_url: Option<String>,
}

/// Decode an OPML payload into its feed outlines.
///
/// Nested outlines are flattened: any `<outline>` carrying an `xmlUrl`
/// attribute counts as a subscription regardless of depth; folder outlines
/// without one are traversed but not returned. A payload without an `<opml>`
/// root is rejected as malformed.
pub fn decode(payload: &str) -> Result<Vec<Outline>, OpmlError> {
    let mut reader = Reader::from_str(payload);
    reader.config_mut().trim_text(true);

    let mut outlines = Vec::new();
    let mut buf = Vec::new();
    let mut depth: usize = 0;
    let mut saw_root = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"opml" => {
                saw_root = true;
            }
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                if let Some(outline) = outline_from_attributes(&e, &reader)? {
                    outlines.push(outline);
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                // Self-closing outline does not affect depth.
                if let Some(outline) = outline_from_attributes(&e, &reader)? {
                    outlines.push(outline);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::Malformed(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(OpmlError::Malformed("missing <opml> root element".into()));
    }

    Ok(outlines)
}

/// Extract a subscription from an outline element's attributes. Returns
/// `None` for folder outlines without an `xmlUrl`.
fn outline_from_attributes(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Option<Outline>, OpmlError> {
    let mut xml_url = None;
    let mut html_url = None;
    let mut title = None;
    let mut text = None;

    let decoder = reader.decoder();
    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(decoder)
            .map_err(|e| OpmlError::Malformed(e.to_string()))?
            .to_string();
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value),
            b"htmlUrl" => html_url = Some(value),
            b"title" => title = Some(value),
            b"text" => text = Some(value),
            _ => {}
        }
    }

    Ok(xml_url.map(|url| Outline {
        title: title.or(text).unwrap_or_else(|| url.clone()),
        xml_url: url,
        html_url,
    }))
}

/// Encode feed outlines as an OPML 2.0 document. Deterministic for a given
/// input sequence.
pub fn encode(title: Option<&str>, outlines: &[Outline]) -> Result<String, OpmlError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    let write = |res: Result<(), std::io::Error>| res.map_err(|e| OpmlError::Encode(e.to_string()));

    write(writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None))))?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    write(writer.write_event(Event::Start(opml)))?;

    write(writer.write_event(Event::Start(BytesStart::new("head"))))?;
    write(writer.write_event(Event::Start(BytesStart::new("title"))))?;
    write(writer.write_event(Event::Text(BytesText::new(
        title.unwrap_or(DEFAULT_EXPORT_TITLE),
    ))))?;
    write(writer.write_event(Event::End(BytesEnd::new("title"))))?;
    write(writer.write_event(Event::End(BytesEnd::new("head"))))?;

    write(writer.write_event(Event::Start(BytesStart::new("body"))))?;
    for outline in outlines {
        let mut elem = BytesStart::new("outline");
        elem.push_attribute(("type", "rss"));
        elem.push_attribute(("text", outline.title.as_str()));
        elem.push_attribute(("title", outline.title.as_str()));
        elem.push_attribute(("xmlUrl", outline.xml_url.as_str()));
        if let Some(ref html_url) = outline.html_url {
            elem.push_attribute(("htmlUrl", html_url.as_str()));
        }
        write(writer.write_event(Event::Empty(elem)))?;
    }
    write(writer.write_event(Event::End(BytesEnd::new("body"))))?;
    write(writer.write_event(Event::End(BytesEnd::new("opml"))))?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(|e| OpmlError::Encode(e.to_string()))
}
