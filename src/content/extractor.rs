use scraper::{ElementRef, Html, Node, Selector};
use std::sync::OnceLock;

/// Elements that never carry article text.
const NOISE_TAGS: &[&str] = &[
    "script", "style", "noscript", "nav", "header", "footer", "aside", "form", "button",
];

/// Class/id fragments marking page chrome rather than body text.
const NOISE_PATTERNS: &[&str] = &[
    "sidebar",
    "navigation",
    "navbar",
    "menu",
    "advert",
    "comment",
    "social",
    "share",
    "related",
    "newsletter",
    "popup",
    "modal",
    "cookie",
];

/// Content containers in priority order: semantic tags, then CMS conventions.
const CONTAINER_SELECTORS: &[&str] = &[
    "article",
    "[itemprop=\"articleBody\"]",
    "main",
    "[role=\"main\"]",
    ".post-content",
    ".entry-content",
    ".article-content",
    ".article-body",
    ".article__body",
    ".post-body",
    ".story-body",
    ".content-body",
    "#article-body",
    ".single-post",
    ".blog-post",
    ".td-post-content",
    ".rich-text",
    ".post",
    "#main-content",
    ".main-content",
    "#content",
    ".content",
];

const BLOCK_TAGS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "li",
];

/// Blocks shorter than this inside a container are dropped (bylines, captions).
const MIN_BLOCK_CHARS: usize = 30;
/// A container must yield more than this to be accepted.
const MIN_CONTAINER_CHARS: usize = 200;
/// Paragraph length that counts towards a run in the paragraph fallback.
const MIN_RUN_PARAGRAPH_CHARS: usize = 50;
const MIN_RUN_LENGTH: usize = 3;
/// Line length kept by the last-resort line filter.
const MIN_LINE_CHARS: usize = 50;
const MIN_LINES_TOTAL_CHARS: usize = 500;

/// Heuristic main-body extractor for article pages.
///
/// Steps are tried in order of confidence and the first one that clears
/// its threshold wins:
///
/// 1. content containers (`article`, `main`, CMS classes)
/// 2. runs of three or more consecutive long paragraphs
/// 3. every long text line on the page
///
/// Navigation, ads, comment sections and similar chrome are ignored
/// throughout. `None` means "no content found", not an error.
pub struct ArticleExtractor {
    containers: Vec<Selector>,
}

impl Default for ArticleExtractor {
    fn default() -> Self {
        Self {
            containers: CONTAINER_SELECTORS
                .iter()
                .filter_map(|s| Selector::parse(s).ok())
                .collect(),
        }
    }
}

impl ArticleExtractor {
    pub fn extract(&self, html: &str) -> Option<String> {
        let document = Html::parse_document(html);

        self.from_containers(&document)
            .or_else(|| from_paragraph_runs(&document))
            .or_else(|| from_long_lines(&document))
    }

    fn from_containers(&self, document: &Html) -> Option<String> {
        for selector in &self.containers {
            let Some(container) = document.select(selector).find(|el| !is_within_noise(el)) else {
                continue;
            };

            let text = container_text(container);
            if text.chars().count() > MIN_CONTAINER_CHARS {
                return Some(text);
            }
            tracing::trace!(
                chars = text.chars().count(),
                "Content container too thin, trying next selector"
            );
        }
        None
    }
}

/// Extracts the main text of an HTML page with the default extractor.
pub fn extract_main_content(html: &str) -> Option<String> {
    static EXTRACTOR: OnceLock<ArticleExtractor> = OnceLock::new();
    EXTRACTOR.get_or_init(ArticleExtractor::default).extract(html)
}

fn container_text(container: ElementRef<'_>) -> String {
    let mut blocks = Vec::new();

    for el in container.descendants().filter_map(ElementRef::wrap) {
        let name = el.value().name();
        if !BLOCK_TAGS.contains(&name) || is_within_noise(&el) || has_block_ancestor(&el, container) {
            continue;
        }

        let text = collapse_whitespace(&el.text().collect::<String>());
        if text.chars().count() < MIN_BLOCK_CHARS {
            continue;
        }

        if name.starts_with('h') {
            blocks.push(format!("\n{}", text));
        } else {
            blocks.push(text);
        }
    }

    blocks.join("\n\n")
}

fn from_paragraph_runs(document: &Html) -> Option<String> {
    let mut kept: Vec<String> = Vec::new();
    let mut run: Vec<String> = Vec::new();

    let paragraphs = document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "p" && !is_within_noise(el));

    for p in paragraphs {
        let text = collapse_whitespace(&p.text().collect::<String>());
        if text.chars().count() > MIN_RUN_PARAGRAPH_CHARS {
            run.push(text);
        } else {
            flush_run(&mut run, &mut kept);
        }
    }
    flush_run(&mut run, &mut kept);

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("\n\n"))
    }
}

fn flush_run(run: &mut Vec<String>, kept: &mut Vec<String>) {
    if run.len() >= MIN_RUN_LENGTH {
        kept.append(run);
    } else {
        run.clear();
    }
}

fn from_long_lines(document: &Html) -> Option<String> {
    let mut lines = Vec::new();

    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let noisy = node
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|el| is_noise(&el));
        if noisy {
            continue;
        }

        for line in text.split('\n') {
            let line = collapse_whitespace(line);
            if line.chars().count() > MIN_LINE_CHARS {
                lines.push(line);
            }
        }
    }

    let total: usize = lines.iter().map(|l| l.chars().count()).sum();
    if total > MIN_LINES_TOTAL_CHARS {
        Some(lines.join("\n\n"))
    } else {
        None
    }
}

fn is_noise(el: &ElementRef<'_>) -> bool {
    let element = el.value();
    let name = element.name();
    if NOISE_TAGS.contains(&name) {
        return true;
    }
    // A class on <body> such as "menu-open" must not discard the whole page.
    if name == "html" || name == "body" {
        return false;
    }

    let id_matches = element.id().is_some_and(matches_noise_pattern);
    id_matches || element.classes().any(matches_noise_pattern)
}

fn matches_noise_pattern(token: &str) -> bool {
    let token = token.to_ascii_lowercase();
    if token == "ad" || token == "ads" || token.starts_with("ad-") || token.starts_with("ads-") {
        return true;
    }
    NOISE_PATTERNS.iter().any(|p| token.contains(p))
}

fn is_within_noise(el: &ElementRef<'_>) -> bool {
    is_noise(el) || el.ancestors().filter_map(ElementRef::wrap).any(|a| is_noise(&a))
}

/// True when a block element sits inside another block below `container`,
/// e.g. a `<p>` inside a `<blockquote>`; the outer block already holds its text.
fn has_block_ancestor(el: &ElementRef<'_>, container: ElementRef<'_>) -> bool {
    for ancestor in el.ancestors() {
        if ancestor == *container {
            return false;
        }
        if let Some(a) = ElementRef::wrap(ancestor) {
            if BLOCK_TAGS.contains(&a.value().name()) {
                return true;
            }
        }
    }
    false
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentence(words: usize) -> String {
        (0..words)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_article_container_wins() {
        let body = sentence(20);
        let html = format!(
            r#"<html><body>
                <nav><p>{body} navigation text that should never appear</p></nav>
                <article>
                    <h2>A heading that is long enough to keep</h2>
                    <p>{body}</p>
                    <p>{body}</p>
                    <p>Too short</p>
                    <p>{body}</p>
                </article>
                <footer><p>{body} footer</p></footer>
            </body></html>"#
        );

        let text = extract_main_content(&html).unwrap();
        assert!(text.starts_with("\nA heading that is long enough to keep\n\n"));
        assert_eq!(text.matches(&body).count(), 3);
        assert!(!text.contains("navigation text"));
        assert!(!text.contains("footer"));
        assert!(!text.contains("Too short"));
    }

    #[test]
    fn test_noise_inside_container_is_skipped() {
        let body = sentence(20);
        let html = format!(
            r#"<article>
                <p>{body}</p><p>{body}</p><p>{body}</p>
                <div class="social-share"><p>Share this article with all of your friends today</p></div>
                <div id="comments"><p>First comment that is definitely long enough</p></div>
            </article>"#
        );

        let text = extract_main_content(&html).unwrap();
        assert!(!text.contains("Share this"));
        assert!(!text.contains("First comment"));
    }

    #[test]
    fn test_thin_container_falls_through_to_next_selector() {
        let body = sentence(20);
        let html = format!(
            r#"<article><p>Only a short teaser line here, nothing more.</p></article>
               <div class="entry-content"><p>{body}</p><p>{body}</p><p>{body}</p></div>"#
        );

        let text = extract_main_content(&html).unwrap();
        assert_eq!(text.matches(&body).count(), 3);
        assert!(!text.contains("teaser"));
    }

    #[test]
    fn test_nested_blocks_not_duplicated() {
        let body = sentence(20);
        let html = format!(
            r#"<article>
                <blockquote><p>{body} quoted</p></blockquote>
                <p>{body}</p><p>{body}</p>
            </article>"#
        );

        let text = extract_main_content(&html).unwrap();
        assert_eq!(text.matches("quoted").count(), 1);
    }

    #[test]
    fn test_paragraph_run_fallback() {
        let body = sentence(15);
        let html = format!(
            r#"<div class="wrapper">
                <p>short</p>
                <p>{body} one</p><p>{body} two</p><p>{body} three</p>
                <p>tiny</p>
                <p>{body} lonely</p>
            </div>"#
        );

        let text = extract_main_content(&html).unwrap();
        assert!(text.contains("one"));
        assert!(text.contains("three"));
        assert!(!text.contains("lonely"));
        assert!(!text.contains("tiny"));
    }

    #[test]
    fn test_long_line_last_resort() {
        // No container, no paragraphs at all, but plenty of long lines
        let line = sentence(12);
        let divs: String = (0..8).map(|i| format!("<div>{line} line{i}</div>")).collect();
        let html = format!(r#"<html><body><div class="wrapper">{divs}</div></body></html>"#);

        let text = extract_main_content(&html).unwrap();
        assert!(text.contains("line0"));
        assert!(text.contains("line7"));
        assert!(text.chars().count() > 500);
    }

    #[test]
    fn test_long_lines_below_total_threshold_is_none() {
        let line = sentence(12);
        let html = format!(r#"<div>{line}</div><div>{line}</div>"#);
        assert_eq!(extract_main_content(&html), None);
    }

    #[test]
    fn test_empty_page_is_none() {
        assert_eq!(extract_main_content("<html><body></body></html>"), None);
        assert_eq!(extract_main_content(""), None);
    }

    #[test]
    fn test_body_class_does_not_hide_page() {
        let line = sentence(12);
        let divs: String = (0..8).map(|i| format!("<div>{line} {i}</div>")).collect();
        let html = format!(r#"<html><body class="menu-open">{divs}</body></html>"#);
        assert!(extract_main_content(&html).is_some());
    }

    #[test]
    fn test_noise_pattern_matching() {
        assert!(matches_noise_pattern("sidebar-left"));
        assert!(matches_noise_pattern("ad"));
        assert!(matches_noise_pattern("ad-slot"));
        assert!(matches_noise_pattern("Related-Posts"));
        assert!(!matches_noise_pattern("headline"));
        assert!(!matches_noise_pattern("admin-bar-free"));
    }
}
