use std::borrow::Cow;

/// Ellipsis appended to truncated titles
const ELLIPSIS: &str = "...";

/// Strips terminal control characters and ANSI escape sequences from a string.
///
/// Feed XML and scraped HTML are attacker-controlled; titles and descriptions
/// pass through here before they are stored. Tab, newline and carriage return
/// are preserved.
///
/// Returns `Cow::Borrowed` when nothing needs stripping.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let needs_strip = s
        .chars()
        .any(|c| c == '\x1b' || c == '\x7f' || (c < ' ' && c != '\t' && c != '\n' && c != '\r'));

    if !needs_strip {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // CSI sequence: ESC [ params... final byte in 0x40..=0x7e
            if chars.peek() == Some(&'[') {
                chars.next();
                for next in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&next) {
                        break;
                    }
                }
            }
            continue;
        }
        if c == '\x7f' || (c < ' ' && c != '\t' && c != '\n' && c != '\r') {
            continue;
        }
        out.push(c);
    }

    Cow::Owned(out)
}

/// Truncates `s` to at most `max_chars` characters, ending with "..." when cut.
///
/// Counts characters rather than bytes so multi-byte titles never split a
/// code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    if s.chars().count() <= max_chars {
        return Cow::Borrowed(s);
    }

    let ellipsis_len = ELLIPSIS.len();
    if max_chars <= ellipsis_len {
        return Cow::Owned(s.chars().take(max_chars).collect());
    }

    let mut out: String = s.chars().take(max_chars - ellipsis_len).collect();
    out.push_str(ELLIPSIS);
    Cow::Owned(out)
}

/// Derives a stub title from the last path segment of a URL.
///
/// Falls back to the whole URL when the last segment is empty
/// (e.g. `https://example.com/`).
pub fn title_from_url(url: &str, max_chars: usize) -> String {
    let segment = url.rsplit('/').next().unwrap_or_default();
    let title = if segment.is_empty() { url } else { segment };
    truncate_chars(title, max_chars).into_owned()
}

/// Turns a URL slug into a readable title: `my-first-post` becomes `My First Post`.
///
/// File extensions (`.html`, `.php`) and query strings are dropped.
pub fn humanize_slug(slug: &str) -> String {
    let slug = slug.split(['?', '#']).next().unwrap_or_default();
    let slug = match slug.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() <= 5 => stem,
        _ => slug,
    };

    slug.split(['-', '_'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
