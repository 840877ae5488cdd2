//! The fetch-and-classify half of the pricing extractor.
//!
//! Parsing is pure (`pricewatch_core::extract`); this module owns the
//! transport call, the failure taxonomy, and the bot-block check, and turns
//! the result into either a canonical extraction or a terminal crawl status.

use std::sync::Arc;

use chrono::Utc;
use pricewatch_core::extract::{looks_bot_blocked, parse_pricing_page};
use pricewatch_core::model::{CrawlStatus, PricingPayload};
use pricewatch_core::normalize::{content_hash, normalize_html_for_hash, normalize_url};
use pricewatch_storage::{FetchBackend, FetchError, PageArchive};
use tracing::{debug, warn};
use url::Url;

/// Outcome of one extraction attempt against a pricing URL.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Ok {
        content_hash: String,
        payload: PricingPayload,
        confidence: f64,
        is_verified: bool,
    },
    Failed {
        /// One of `Blocked`, `ManualNeeded`, `Error`.
        status: CrawlStatus,
        error: String,
    },
}

impl Extraction {
    fn blocked(error: impl Into<String>) -> Self {
        Extraction::Failed {
            status: CrawlStatus::Blocked,
            error: error.into(),
        }
    }

    fn manual_needed(error: impl Into<String>) -> Self {
        Extraction::Failed {
            status: CrawlStatus::ManualNeeded,
            error: error.into(),
        }
    }

    fn errored(error: impl Into<String>) -> Self {
        Extraction::Failed {
            status: CrawlStatus::Error,
            error: error.into(),
        }
    }
}

pub struct PricingExtractor {
    fetcher: Arc<dyn FetchBackend>,
    archive: Option<PageArchive>,
}

impl PricingExtractor {
    pub fn new(fetcher: Arc<dyn FetchBackend>, archive: Option<PageArchive>) -> Self {
        Self { fetcher, archive }
    }

    async fn archive_page(&self, url: &str, body: &str) {
        let Some(archive) = &self.archive else {
            return;
        };
        let domain = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        if let Err(err) = archive.store_page(&domain, Utc::now(), body).await {
            warn!(url, %err, "failed to archive fetched page");
        }
    }

    /// Fetch and parse one pricing page.
    pub async fn extract(&self, raw_url: &str) -> Extraction {
        let Some(url) = normalize_url(raw_url) else {
            return Extraction::manual_needed(format!("Invalid pricing URL: {raw_url}"));
        };

        let page = match self.fetcher.fetch_page(&url).await {
            Ok(page) => page,
            Err(FetchError::Timeout) => return Extraction::errored(FetchError::Timeout.to_string()),
            Err(FetchError::Transport(message)) => return Extraction::errored(message),
        };

        match page.status {
            401 | 403 | 429 => {
                return Extraction::blocked(format!("HTTP {} from pricing page", page.status))
            }
            200..=299 => {}
            400..=499 => {
                return Extraction::manual_needed(format!(
                    "HTTP {} from pricing page",
                    page.status
                ))
            }
            status => return Extraction::errored(format!("HTTP {status} from pricing page")),
        }

        let html_content_type = page
            .content_type
            .as_deref()
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(false);
        if !html_content_type {
            return Extraction::manual_needed(format!(
                "Unsupported content type: {}",
                page.content_type.as_deref().unwrap_or("<missing>")
            ));
        }

        self.archive_page(&url, &page.body).await;

        let normalized_text = normalize_html_for_hash(&page.body);
        if looks_bot_blocked(&normalized_text) {
            return Extraction::blocked("Bot protection detected on pricing page");
        }

        let parsed = parse_pricing_page(&page.body, &url);
        if !parsed.has_signals {
            return Extraction::manual_needed("No pricing signals found on page");
        }

        debug!(
            url,
            confidence = parsed.confidence,
            mentions = parsed.payload.price_mentions.len(),
            "extracted pricing page"
        );
        Extraction::Ok {
            content_hash: content_hash(&normalized_text),
            payload: parsed.payload,
            confidence: parsed.confidence,
            is_verified: parsed.is_verified,
        }
    }
}
