//! Article body extraction from HTML pages.

mod extractor;

pub use extractor::{extract_main_content, ArticleExtractor};
