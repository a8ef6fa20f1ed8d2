use url::Url;

/// Returns true when `s` parses as an absolute http(s) URL with a host.
pub fn is_http_url(s: &str) -> bool {
    Url::parse(s)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

/// Rate-limit key for a URL: scheme, host and explicit port.
///
/// Two URLs share a key exactly when they talk to the same server, so
/// `https://a.com/x` and `https://a.com/y` are throttled together while
/// `https://b.a.com/` is not.
pub fn origin_key(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

/// Resolves a possibly relative `href` against `base`.
///
/// Absolute URLs pass through the parser (normalized); protocol-relative
/// `//host/path` takes the base's scheme. Returns `None` when neither the
/// href nor the base can be parsed.
pub fn resolve_url(href: &str, base: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    if let Ok(absolute) = Url::parse(href) {
        return Some(absolute.to_string());
    }

    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

/// Normalizes a user-supplied website URL: adds `https://` when no scheme is
/// given and trims trailing slashes.
pub fn normalize_site_url(input: &str) -> String {
    let trimmed = input.trim();
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_owned()
    } else {
        format!("https://{}", trimmed)
    };
    with_scheme.trim_end_matches('/').to_owned()
}

/// Gives a scheme-less `url` the scheme of `reference` (defaulting to http).
pub fn with_scheme_of(url: &str, reference: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_owned();
    }
    let scheme = if reference.starts_with("https://") {
        "https"
    } else {
        "http"
    };
    format!("{}://{}", scheme, url.trim_start_matches("//"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_key_ignores_path() {
        assert_eq!(
            origin_key("https://example.com/a/b?c=1"),
            origin_key("https://example.com/other")
        );
    }

    #[test]
    fn test_origin_key_distinguishes_ports_and_hosts() {
        assert_ne!(
            origin_key("http://127.0.0.1:8080/"),
            origin_key("http://127.0.0.1:9090/")
        );
        assert_ne!(
            origin_key("https://a.example.com/"),
            origin_key("https://b.example.com/")
        );
    }

    #[test]
    fn test_origin_key_rejects_garbage() {
        assert_eq!(origin_key("not a url"), None);
    }

    #[test]
    fn test_resolve_relative_path() {
        assert_eq!(
            resolve_url("feed.xml", "https://example.com/blog/").as_deref(),
            Some("https://example.com/blog/feed.xml")
        );
        assert_eq!(
            resolve_url("/posts/2", "http://x/feed.xml").as_deref(),
            Some("http://x/posts/2")
        );
    }

    #[test]
    fn test_resolve_protocol_relative() {
        assert_eq!(
            resolve_url("//cdn.example.com/feed", "https://example.com").as_deref(),
            Some("https://cdn.example.com/feed")
        );
    }

    #[test]
    fn test_resolve_absolute_passthrough() {
        assert_eq!(
            resolve_url("https://other.com/feed", "https://example.com").as_deref(),
            Some("https://other.com/feed")
        );
    }

    #[test]
    fn test_resolve_empty_href() {
        assert_eq!(resolve_url("  ", "https://example.com"), None);
    }

    #[test]
    fn test_normalize_site_url() {
        assert_eq!(normalize_site_url("example.com/"), "https://example.com");
        assert_eq!(
            normalize_site_url("http://example.com//"),
            "http://example.com"
        );
    }

    #[test]
    fn test_with_scheme_of() {
        assert_eq!(
            with_scheme_of("feeds.example.com/rss", "https://example.com"),
            "https://feeds.example.com/rss"
        );
        assert_eq!(
            with_scheme_of("feeds.example.com/rss", "http://example.com"),
            "http://feeds.example.com/rss"
        );
        assert_eq!(
            with_scheme_of("https://x.com/rss", "http://example.com"),
            "https://x.com/rss"
        );
    }

    #[test]
    fn test_is_http_url() {
        assert!(is_http_url("https://example.com/a"));
        assert!(!is_http_url("urn:uuid:1234"));
        assert!(!is_http_url("/relative"));
    }
}
