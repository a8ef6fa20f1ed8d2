use feed_rs::model::{Entry, FeedType as DocumentType};
use feed_rs::parser;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::storage::{FeedType, ParsedArticle};
use crate::util::{is_http_url, resolve_url, strip_control_chars};

const UNTITLED: &str = "Untitled";
/// Separates fields in the content hash input so ("ab", "c") != ("a", "bc")
const FIELD_SEPARATOR: [u8; 1] = [0x1f];
const CDATA_START: &str = "<![CDATA[";

/// Feed-level metadata from the document header
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedInfo {
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub language: Option<String>,
    /// Unix seconds
    pub updated: Option<i64>,
    /// Type the document declares itself as
    pub kind: Option<FeedType>,
}

impl FeedInfo {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.link.is_none()
    }
}

/// Best-effort parse of one feed document
#[derive(Debug, Clone, Default)]
pub struct FeedParseResult {
    pub feed_info: FeedInfo,
    pub articles: Vec<ParsedArticle>,
    /// False only when nothing could be parsed at all
    pub success: bool,
    pub error: Option<String>,
    /// Entries dropped because no usable URL could be derived
    pub skipped: usize,
}

impl FeedParseResult {
    /// True when the document looks like a real feed: it has entries or a
    /// feed header.
    pub fn is_feed(&self) -> bool {
        self.success && (!self.articles.is_empty() || !self.feed_info.is_empty())
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Hash over the fields that define an article's content.
///
/// SHA-256 of title, content and summary joined by U+001F; missing fields
/// hash as empty strings. Hex encoded.
pub fn content_hash(title: &str, content: Option<&str>, summary: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(content.unwrap_or_default().as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(summary.unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parses an RSS, Atom or JSON feed fetched from `feed_url`.
///
/// Relative entry URLs resolve against `feed_url`. XML with bare `&` or
/// control characters is repaired before parsing. A document the parser
/// still rejects is salvaged entry by entry: well-formed items are kept,
/// `success` stays true and the parser error is reported in `error`.
/// Only if nothing can be salvaged is `success` false.
pub fn parse_feed(feed_url: &str, bytes: &[u8]) -> FeedParseResult {
    let repaired = repair_xml(bytes);
    let source = repaired.as_deref().unwrap_or(bytes);

    let (feed, error) = match parse_document(feed_url, source) {
        Ok(feed) => (feed, None),
        Err(parse_error) => {
            let salvaged = salvage_entries(source)
                .and_then(|doc| parse_document(feed_url, doc.as_bytes()).ok());
            match salvaged {
                Some(feed) => {
                    tracing::warn!(
                        url = %feed_url,
                        error = %parse_error,
                        entries = feed.entries.len(),
                        "Feed is malformed, kept the well-formed entries"
                    );
                    (feed, Some(parse_error))
                }
                None => return FeedParseResult::failed(parse_error),
            }
        }
    };

    let feed_info = FeedInfo {
        title: feed.title.map(|t| clean_text(&t.content)).filter(|t| !t.is_empty()),
        description: feed
            .description
            .map(|d| clean_text(&d.content))
            .filter(|d| !d.is_empty()),
        link: feed
            .links
            .iter()
            .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
            .or_else(|| feed.links.first())
            .and_then(|l| resolve_url(&l.href, feed_url)),
        language: feed.language,
        updated: feed.updated.map(|dt| dt.timestamp()),
        kind: Some(match feed.feed_type {
            DocumentType::Atom => FeedType::Atom,
            _ => FeedType::Rss,
        }),
    };

    let mut articles = Vec::with_capacity(feed.entries.len());
    let mut skipped = 0;
    for entry in feed.entries {
        match parse_entry(feed_url, entry) {
            Some(article) => articles.push(article),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::warn!(url = %feed_url, skipped = skipped, "Entries without a usable URL skipped");
    }

    FeedParseResult {
        feed_info,
        articles,
        success: true,
        error,
        skipped,
    }
}

fn parse_document(feed_url: &str, bytes: &[u8]) -> Result<feed_rs::model::Feed, String> {
    // Entries without an id get an empty one instead of a generated hash,
    // so a missing link and id is detectable.
    parser::Builder::new()
        .base_uri(Some(feed_url))
        .id_generator(|_, _, _| String::new())
        .build()
        .parse(bytes)
        .map_err(|e| e.to_string())
}

fn parse_entry(feed_url: &str, entry: Entry) -> Option<ParsedArticle> {
    let url = entry_url(feed_url, &entry)?;

    let title = entry
        .title
        .as_ref()
        .map(|t| clean_text(&t.content))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());

    let summary = entry
        .summary
        .as_ref()
        .map(|s| s.content.trim().to_string())
        .filter(|s| !s.is_empty());
    let content = entry
        .content
        .as_ref()
        .and_then(|c| c.body.as_deref())
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .or_else(|| summary.clone());

    let author = Some(
        entry
            .authors
            .iter()
            .map(|p| p.name.trim())
            .filter(|n| !n.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
    )
    .filter(|a| !a.is_empty());

    let published_date = entry.published.or(entry.updated).map(|dt| dt.timestamp());
    let tags: Vec<String> = entry
        .categories
        .iter()
        .map(|c| c.term.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    let raw_data = json!({
        "id": entry.id,
        "title": entry.title.as_ref().map(|t| t.content.as_str()),
        "links": entry.links.iter().map(|l| l.href.as_str()).collect::<Vec<_>>(),
        "summary": entry.summary.as_ref().map(|s| s.content.as_str()),
        "content": entry.content.as_ref().and_then(|c| c.body.as_deref()),
        "authors": entry.authors.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        "published": entry.published.map(|d| d.to_rfc3339()),
        "updated": entry.updated.map(|d| d.to_rfc3339()),
        "categories": entry.categories.iter().map(|c| c.term.as_str()).collect::<Vec<_>>(),
    });

    let content_hash = content_hash(&title, content.as_deref(), summary.as_deref());

    Some(ParsedArticle {
        url,
        title,
        content,
        summary,
        author,
        published_date,
        tags,
        content_hash,
        raw_data: Some(raw_data),
    })
}

/// Picks the entry URL: the first http(s) URL among the alternate links,
/// the id, then any other link. Falls back to a non-http link or id (a
/// `tag:` or `urn:` id is still a stable key). `None` only when the entry
/// has neither.
fn entry_url(feed_url: &str, entry: &Entry) -> Option<String> {
    let is_alternate = |rel: Option<&str>| rel.map_or(true, |r| r.eq_ignore_ascii_case("alternate"));
    let id = Some(entry.id.trim()).filter(|id| !id.is_empty());

    let primary: Vec<String> = entry
        .links
        .iter()
        .filter(|l| is_alternate(l.rel.as_deref()))
        .map(|l| l.href.as_str())
        .chain(id)
        .filter_map(|raw| resolve_url(raw, feed_url))
        .collect();
    let other = entry
        .links
        .iter()
        .filter(|l| !is_alternate(l.rel.as_deref()))
        .filter_map(|l| resolve_url(&l.href, feed_url));

    let mut fallback = primary.first().cloned();
    for candidate in primary.into_iter().chain(other) {
        if is_http_url(&candidate) {
            return Some(candidate);
        }
        fallback.get_or_insert(candidate);
    }
    fallback
}

fn clean_text(s: &str) -> String {
    strip_control_chars(s.trim()).into_owned()
}

/// Fixes the breakage most often seen in hand-rolled XML feeds. Returns
/// `None` when there is nothing to repair or the document is not XML.
fn repair_xml(bytes: &[u8]) -> Option<Vec<u8>> {
    let text = String::from_utf8_lossy(bytes);
    if !text.trim_start_matches('\u{feff}').trim_start().starts_with('<') {
        return None;
    }
    let stripped = strip_control_chars(&text);
    let repaired = escape_bare_ampersands(&stripped);
    if repaired == text {
        None
    } else {
        Some(repaired.into_bytes())
    }
}

/// Escapes every `&` that does not start an entity reference. CDATA
/// sections are copied untouched.
fn escape_bare_ampersands(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(i) = rest.find(|c: char| c == '&' || c == '<') {
        out.push_str(&rest[..i]);
        rest = &rest[i..];
        if let Some(after) = rest.strip_prefix('&') {
            out.push_str(if starts_with_entity(after) { "&" } else { "&amp;" });
            rest = after;
        } else if rest.starts_with(CDATA_START) {
            let end = rest.find("]]>").map_or(rest.len(), |e| e + 3);
            out.push_str(&rest[..end]);
            rest = &rest[end..];
        } else {
            out.push('<');
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}

/// True when `rest` (the text after an `&`) is a named or numeric entity reference.
fn starts_with_entity(rest: &str) -> bool {
    let Some(end) = rest.find(';') else {
        return false;
    };
    let name = &rest[..end];
    if let Some(num) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
        return !num.is_empty() && num.chars().all(|c| c.is_ascii_hexdigit());
    }
    if let Some(num) = name.strip_prefix('#') {
        return !num.is_empty() && num.chars().all(|c| c.is_ascii_digit());
    }
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic()) && chars.all(|c| c.is_ascii_alphanumeric())
}

/// Rebuilds a document the parser rejected from its well-formed entries.
///
/// Keeps everything before the first `<item>`/`<entry>` as the header,
/// then every entry that is closed and balanced on its own, then closes
/// the document. Truncated or mismatched entries are dropped. `None` when
/// no entry survives.
fn salvage_entries(source: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(source);
    let (tag, close, trailer) = if find_tag(&text, 0, "item").is_some() {
        let trailer = if text.contains("<rdf:RDF") {
            "</rdf:RDF>"
        } else {
            "</channel></rss>"
        };
        ("item", "</item>", trailer)
    } else {
        ("entry", "</entry>", "</feed>")
    };

    let first = find_tag(&text, 0, tag)?;
    let mut doc = String::with_capacity(text.len() + trailer.len());
    doc.push_str(&text[..first]);

    let mut kept = 0;
    let mut pos = first;
    while let Some(start) = find_tag(&text, pos, tag) {
        let Some(end) = text[start..].find(close).map(|i| start + i + close.len()) else {
            break;
        };
        // An entry that never closes before the next one starts is dropped
        if let Some(next) = find_tag(&text, start + 1, tag) {
            if next < end {
                pos = next;
                continue;
            }
        }
        let fragment = &text[start..end];
        if is_well_formed(fragment) {
            doc.push_str(fragment);
            kept += 1;
        }
        pos = end;
    }

    if kept == 0 {
        return None;
    }
    doc.push_str(trailer);
    Some(doc)
}

/// Byte offset of the next `<name` start tag at or after `from`.
fn find_tag(text: &str, from: usize, name: &str) -> Option<usize> {
    let open = format!("<{}", name);
    let mut pos = from;
    while let Some(i) = text.get(pos..)?.find(&open) {
        let at = pos + i;
        match text[at + open.len()..].chars().next() {
            Some('>' | '/' | ' ' | '\t' | '\n' | '\r') => return Some(at),
            _ => pos = at + open.len(),
        }
    }
    None
}

/// True when `fragment` is balanced XML with matching end tags.
fn is_well_formed(fragment: &str) -> bool {
    let mut reader = Reader::from_str(fragment);
    let mut depth = 0usize;
    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            Ok(Event::Eof) => return depth == 0,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}
