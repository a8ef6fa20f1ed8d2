use crate::config::HttpConfig;
use crate::http::RateLimiter;
use crate::util::origin_key;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, USER_AGENT};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Errors from a single logical HTTP request (after retries).
#[derive(Debug, Error)]
pub enum FetchError {
    /// Every attempt exceeded the request timeout
    #[error("Request timed out")]
    Timeout,
    /// Non-2xx response; never retried
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Connection, DNS or TLS failure; never retried
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Article page fetch returned something other than HTML
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Only timeouts are retried. A 4xx/5xx or a refused connection is
    /// terminal for the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Timeout)
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(e)
        }
    }
}

/// Header set sent with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestProfile {
    /// Lightweight headers for feeds, sitemaps and probes.
    Feed,
    /// Full browser header set for article pages, which are more likely
    /// to sit behind bot filters.
    Page,
}

/// Explicit client configuration; nothing is read from globals.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub max_body_bytes: usize,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        HttpClientConfig::from(&HttpConfig::default())
    }
}

impl From<&HttpConfig> for HttpClientConfig {
    fn from(config: &HttpConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_retries: config.max_retries,
            max_body_bytes: config.max_body_bytes,
            user_agent: config.user_agent.clone(),
        }
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Final URL after redirects
    pub url: String,
    /// `Content-Type` with parameters stripped, lowercased
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct == "text/html" || ct.starts_with("application/xhtml"))
    }
}

/// Shared HTTP client: connection pool, header profiles, per-origin rate
/// limiting and timeout retries.
///
/// Cheap to clone; clones share the pool and the rate limiter.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    config: Arc<HttpClientConfig>,
    limiter: Arc<RateLimiter>,
    feed_headers: HeaderMap,
    page_headers: HeaderMap,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig, limiter: Arc<RateLimiter>) -> Result<Self, FetchError> {
        let inner = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(config.timeout)
            .build()?;

        let user_agent = HeaderValue::from_str(&config.user_agent).unwrap_or_else(|_| {
            tracing::warn!(user_agent = %config.user_agent, "Invalid user agent, using default");
            HeaderValue::from_static(DEFAULT_USER_AGENT)
        });

        Ok(Self {
            inner,
            feed_headers: feed_headers(user_agent.clone()),
            page_headers: page_headers(user_agent),
            config: Arc::new(config),
            limiter,
        })
    }

    /// GET with the configured timeout.
    pub async fn get(&self, url: &str, profile: RequestProfile) -> Result<HttpResponse, FetchError> {
        self.get_with_timeout(url, profile, self.config.timeout).await
    }

    /// GET with an explicit per-attempt timeout.
    ///
    /// Retries up to `max_retries` additional times when an attempt times
    /// out. Any other error is returned immediately.
    pub async fn get_with_timeout(
        &self,
        url: &str,
        profile: RequestProfile,
        timeout: Duration,
    ) -> Result<HttpResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.get_once(url, profile, timeout).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        url = %url,
                        attempt = attempt,
                        max_retries = self.config.max_retries,
                        "Request timed out, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetches an article page. Non-HTML responses are rejected with
    /// [`FetchError::UnsupportedContentType`] and never returned.
    pub async fn get_html(&self, url: &str) -> Result<String, FetchError> {
        let response = self.get(url, RequestProfile::Page).await?;
        if !response.is_html() {
            return Err(FetchError::UnsupportedContentType(
                response.content_type.unwrap_or_else(|| "unknown".to_owned()),
            ));
        }
        Ok(response.text())
    }

    /// Lightweight existence check: HEAD request answered with 200.
    ///
    /// Used for speculative probes, so every failure reads as "absent".
    pub async fn exists(&self, url: &str, timeout: Duration) -> bool {
        let Some(origin) = origin_key(url) else {
            return false;
        };
        self.limiter.acquire(&origin).await;

        let request = self
            .inner
            .head(url)
            .headers(self.feed_headers.clone())
            .timeout(timeout)
            .send();

        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(response)) => response.status() == reqwest::StatusCode::OK,
            Ok(Err(e)) => {
                tracing::debug!(url = %url, error = %e, "HEAD probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(url = %url, "HEAD probe timed out");
                false
            }
        }
    }

    async fn get_once(
        &self,
        url: &str,
        profile: RequestProfile,
        timeout: Duration,
    ) -> Result<HttpResponse, FetchError> {
        let origin = origin_key(url).ok_or_else(|| FetchError::InvalidUrl(url.to_owned()))?;
        self.limiter.acquire(&origin).await;

        let headers = match profile {
            RequestProfile::Feed => self.feed_headers.clone(),
            RequestProfile::Page => self.page_headers.clone(),
        };

        let response = tokio::time::timeout(
            timeout,
            self.inner.get(url).headers(headers).timeout(timeout).send(),
        )
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase());

        let body = tokio::time::timeout(timeout, read_limited_bytes(response, self.config.max_body_bytes))
            .await
            .map_err(|_| FetchError::Timeout)??;

        Ok(HttpResponse {
            status: status.as_u16(),
            url: final_url,
            content_type,
            body,
        })
    }
}

fn feed_headers(user_agent: HeaderValue) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, user_agent);
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5",
        ),
    );
    headers
}

fn page_headers(user_agent: HeaderValue) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, user_agent);
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(
        HeaderName::from_static("upgrade-insecure-requests"),
        HeaderValue::from_static("1"),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-dest"),
        HeaderValue::from_static("document"),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("navigate"),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-site"),
        HeaderValue::from_static("none"),
    );
    headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("max-age=0"),
    );
    headers
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::from_reqwest)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
