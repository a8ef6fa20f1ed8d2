mod client;
mod rate_limit;

pub use client::{FetchError, HttpClient, HttpClientConfig, HttpResponse, RequestProfile};
pub use rate_limit::RateLimiter;
