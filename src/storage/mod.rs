mod articles;
mod feeds;
mod fetch_logs;
mod schema;
mod types;
mod websites;

pub use schema::Database;
pub use types::{
    Article, DatabaseError, Feed, FeedArticleCount, FeedHealth, FeedType, FetchLog, FetchOutcome,
    NewFeed, ParsedArticle, Reconciliation, UnknownFeedType, Website,
};
