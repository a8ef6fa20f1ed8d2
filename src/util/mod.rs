//! Utility functions shared across the pipeline.
//!
//! - **URL handling**: origin keys for rate limiting, relative URL resolution,
//!   site URL normalization
//! - **Text processing**: control character stripping, title truncation and
//!   slug humanization
//!
//! # Examples
//!
//! ```
//! use feedharvest::util::{origin_key, resolve_url, truncate_chars};
//!
//! assert_eq!(origin_key("https://example.com:8443/feed").as_deref(), Some("https://example.com:8443"));
//! assert_eq!(resolve_url("/rss", "https://example.com/blog/").as_deref(), Some("https://example.com/rss"));
//! assert_eq!(truncate_chars("abcdef", 5), "ab...");
//! ```

mod text;
mod url;

pub use self::text::{humanize_slug, strip_control_chars, title_from_url, truncate_chars};
pub use self::url::{is_http_url, normalize_site_url, origin_key, resolve_url, with_scheme_of};
