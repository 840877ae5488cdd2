//! Bounded HTTP fetch for crawl targets.
//!
//! One GET per crawl attempt: retries are the scheduler's job (each failure
//! status has its own backoff window), so the fetcher only classifies. The
//! `FetchBackend` seam exists so pipeline tests can script responses and a
//! future headless backend can slot in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, CACHE_CONTROL};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, Instrument};
use url::Url;

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml;q=0.9,*/*;q=0.5";

/// A fetched page, body already truncated to the configured length.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The per-fetch deadline elapsed. The message is load-bearing: it is
    /// recorded verbatim as the company's crawl error.
    #[error("Request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Transport(String),
}

/// Transport seam for the extractor and discovery stages.
#[async_trait]
pub trait FetchBackend: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_body_chars: usize,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: "pricewatch-bot/0.1 (+https://pricewatch.dev/bot)".to_string(),
            max_body_chars: 1_000_000,
            global_concurrency: 16,
            per_host_concurrency: 4,
        }
    }
}

/// reqwest-backed fetcher with global and per-host concurrency caps.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    max_body_chars: usize,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            max_body_chars: config.max_body_chars,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }
}

/// Cut a body down to at most `max` characters on a char boundary.
pub fn truncate_chars(body: String, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((idx, _)) => body[..idx].to_string(),
        None => body,
    }
}

#[async_trait]
impl FetchBackend for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_host = self.per_host_semaphore(&host).await;
        let _host_permit = per_host.acquire().await.expect("semaphore not closed");

        let span = info_span!("fetch_page", url, host = %host);
        async {
            let response = self
                .client
                .get(url)
                .header(ACCEPT, HeaderValue::from_static(ACCEPT_HTML))
                .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
                .send()
                .await
                .map_err(|err| {
                    if err.is_timeout() {
                        FetchError::Timeout
                    } else {
                        FetchError::Transport(err.to_string())
                    }
                })?;

            let status = response.status().as_u16();
            let final_url = response.url().to_string();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.map_err(|err| {
                if err.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Transport(err.to_string())
                }
            })?;

            Ok(FetchedPage {
                final_url,
                status,
                content_type,
                body: truncate_chars(body, self.max_body_chars),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_is_char_safe_and_silent() {
        let body = "é".repeat(10);
        assert_eq!(truncate_chars(body.clone(), 4), "é".repeat(4));
        assert_eq!(truncate_chars(body.clone(), 10), body);
        assert_eq!(truncate_chars(body, 100).chars().count(), 10);
    }

    #[test]
    fn timeout_error_carries_the_canonical_reason() {
        assert_eq!(FetchError::Timeout.to_string(), "Request timed out");
    }
}
