//! Homepage fetch + pricing-link scoring.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use pricewatch_core::discovery::{score_pricing_links, DiscoveryConfig, DiscoveryOutcome};
use pricewatch_core::normalize::normalize_url;
use pricewatch_storage::FetchBackend;
use tracing::debug;

pub struct PricingDiscovery {
    fetcher: Arc<dyn FetchBackend>,
    config: DiscoveryConfig,
}

impl PricingDiscovery {
    pub fn new(fetcher: Arc<dyn FetchBackend>, config: DiscoveryConfig) -> Self {
        Self { fetcher, config }
    }

    /// Fetch a homepage and score its internal links as pricing-URL
    /// candidates. Zero qualifying anchors is a success with an empty list.
    pub async fn discover(
        &self,
        homepage_url: &str,
        allowed_domain: &str,
    ) -> Result<DiscoveryOutcome> {
        let url = normalize_url(homepage_url)
            .ok_or_else(|| anyhow!("invalid homepage URL: {homepage_url}"))?;
        let page = self
            .fetcher
            .fetch_page(&url)
            .await
            .map_err(|err| anyhow!("homepage fetch failed: {err}"))?;
        if !(200..=299).contains(&page.status) {
            return Err(anyhow!("homepage fetch returned HTTP {}", page.status));
        }
        let outcome = score_pricing_links(&page.body, &url, allowed_domain, &self.config);
        debug!(
            homepage = url,
            candidates = outcome.candidates.len(),
            recommended = outcome.recommended_primary_url.as_deref().unwrap_or(""),
            "discovery complete"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::FixtureFetcher;

    #[tokio::test]
    async fn discovery_scores_homepage_anchors() {
        let fetcher = FixtureFetcher::new().with_html(
            "https://acme.example/",
            r#"<nav><a href="/pricing">Pricing</a><a href="/blog">Blog</a></nav>"#,
        );
        let discovery =
            PricingDiscovery::new(Arc::new(fetcher), DiscoveryConfig::default());
        let outcome = discovery
            .discover("https://acme.example", "acme.example")
            .await
            .unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(
            outcome.recommended_primary_url.as_deref(),
            Some("https://acme.example/pricing")
        );
    }

    #[tokio::test]
    async fn unreachable_homepage_is_an_error() {
        let fetcher = FixtureFetcher::new();
        let discovery =
            PricingDiscovery::new(Arc::new(fetcher), DiscoveryConfig::default());
        assert!(discovery
            .discover("https://acme.example", "acme.example")
            .await
            .is_err());
    }
}
