//! feedharvest: website feed discovery, polling and article backfill.
//!
//! The crate is split along the pipeline:
//!
//! - [`http`]: rate-limited, retrying HTTP client
//! - [`content`]: main-body extraction from article HTML
//! - [`feed`]: feed parsing, sitemap expansion, discovery and the fetch pipeline
//! - [`storage`]: SQLite persistence
//! - [`tasks`]: scheduler-facing entry points and the worker pool

pub mod config;
pub mod content;
pub mod feed;
pub mod http;
pub mod storage;
pub mod tasks;
pub mod util;
