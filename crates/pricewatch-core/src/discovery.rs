//! Pricing-URL discovery: score internal links on a homepage, and merge
//! candidate lists. Fetching lives in the crawl crate.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::canonical::round2;
use crate::model::PricingCandidate;
use crate::normalize::{matches_domain, normalize_url, strip_html_to_text};

static ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#).unwrap()
});

const PATH_POSITIVE: &[(&str, f64)] = &[
    ("/pricing", 0.85),
    ("/plans", 0.70),
    ("/plan", 0.60),
    ("pricing", 0.55),
    ("price", 0.45),
];

const TEXT_POSITIVE: &[(&str, f64)] = &[
    ("pricing", 0.42),
    ("plans", 0.35),
    ("free trial", 0.30),
    ("plan", 0.25),
];

const PATH_NEGATIVE: &[&str] = &[
    "/blog", "/docs", "/legal", "/login", "/signup", "/careers", "/support", "/about", "/contact",
];

const TEXT_NEGATIVE: &[&str] = &["blog", "docs", "login", "sign in", "careers"];

const ASSET_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico", ".css", ".js", ".pdf", ".zip",
];

const BOTH_HIT_BONUS: f64 = 0.08;

/// Tunable discovery thresholds. The primary-recommendation pair is
/// deliberately configuration, not constants in the scorer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscoveryConfig {
    pub min_confidence: f64,
    pub max_candidates: usize,
    pub primary_threshold: f64,
    pub primary_gap: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.35,
            max_candidates: 8,
            primary_threshold: 0.86,
            primary_gap: 0.08,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryOutcome {
    pub candidates: Vec<PricingCandidate>,
    pub recommended_primary_url: Option<String>,
}

fn positive_score(haystack: &str, patterns: &[(&str, f64)]) -> f64 {
    patterns
        .iter()
        .filter(|(needle, _)| haystack.contains(needle))
        .map(|(_, weight)| *weight)
        .fold(0.0, f64::max)
}

fn score_anchor(path: &str, text: &str) -> f64 {
    // A negative hit on either side disqualifies outright: asset links,
    // known non-pricing sections, and anchors labelled as such never
    // qualify no matter how pricing-like the other side looks.
    if ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        || PATH_NEGATIVE.iter().any(|needle| path.contains(needle))
        || TEXT_NEGATIVE.iter().any(|needle| text.contains(needle))
    {
        return 0.0;
    }
    let path_score = positive_score(path, PATH_POSITIVE);
    let text_score = positive_score(text, TEXT_POSITIVE);
    let mut score = path_score + text_score;
    if path_score > 0.0 && text_score > 0.0 {
        score += BOTH_HIT_BONUS;
    }
    round2(score.clamp(0.0, 1.0))
}

fn sort_candidates(candidates: &mut [PricingCandidate]) {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.url.cmp(&b.url))
    });
}

/// Score the anchors of a homepage as pricing-page candidates. Only links on
/// `allowed_domain` (or its subdomains) qualify; a primary is recommended
/// only for unambiguous winners.
pub fn score_pricing_links(
    html: &str,
    base_url: &str,
    allowed_domain: &str,
    config: &DiscoveryConfig,
) -> DiscoveryOutcome {
    let Ok(base) = Url::parse(base_url) else {
        return DiscoveryOutcome::default();
    };

    let mut by_url: HashMap<String, f64> = HashMap::new();
    for caps in ANCHOR_RE.captures_iter(html) {
        let href = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("javascript:")
        {
            continue;
        }
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        let Some(url) = normalize_url(resolved.as_str()) else {
            continue;
        };
        if !matches_domain(&url, allowed_domain) {
            continue;
        }
        let Ok(parsed) = Url::parse(&url) else {
            continue;
        };
        let path = parsed.path().to_lowercase();
        let text = strip_html_to_text(caps.get(2).map(|m| m.as_str()).unwrap_or("")).to_lowercase();
        let score = score_anchor(&path, &text);
        if score < config.min_confidence {
            continue;
        }
        let entry = by_url.entry(url).or_insert(0.0);
        *entry = entry.max(score);
    }

    let mut candidates: Vec<PricingCandidate> = by_url
        .into_iter()
        .map(|(url, confidence)| PricingCandidate {
            url,
            confidence,
            selected_by_user: false,
        })
        .collect();
    sort_candidates(&mut candidates);
    candidates.truncate(config.max_candidates);

    let recommended_primary_url = match candidates.as_slice() {
        [] => None,
        [top] if top.confidence >= config.primary_threshold => Some(top.url.clone()),
        [top, runner_up, ..]
            if top.confidence >= config.primary_threshold
                && top.confidence - runner_up.confidence >= config.primary_gap =>
        {
            Some(top.url.clone())
        }
        _ => None,
    };

    DiscoveryOutcome {
        candidates,
        recommended_primary_url,
    }
}

/// Union candidate lists by normalized URL, keeping the maximum confidence
/// seen and OR-reducing the user-selected flag. Commutative.
pub fn merge_candidates(
    existing: &[PricingCandidate],
    incoming: &[PricingCandidate],
) -> Vec<PricingCandidate> {
    let mut by_url: HashMap<String, PricingCandidate> = HashMap::new();
    for candidate in existing.iter().chain(incoming.iter()) {
        let Some(url) = normalize_url(&candidate.url) else {
            continue;
        };
        by_url
            .entry(url.clone())
            .and_modify(|merged| {
                merged.confidence = merged.confidence.max(candidate.confidence);
                merged.selected_by_user |= candidate.selected_by_user;
            })
            .or_insert(PricingCandidate {
                url,
                confidence: candidate.confidence,
                selected_by_user: candidate.selected_by_user,
            });
    }
    let mut merged: Vec<PricingCandidate> = by_url.into_values().collect();
    sort_candidates(&mut merged);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discover(html: &str) -> DiscoveryOutcome {
        score_pricing_links(
            html,
            "https://acme.example/",
            "acme.example",
            &DiscoveryConfig::default(),
        )
    }

    #[test]
    fn lone_pricing_anchor_is_recommended_primary() {
        let outcome = discover(r#"<a href="/pricing">Pricing</a>"#);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].url, "https://acme.example/pricing");
        assert_eq!(outcome.candidates[0].confidence, 1.0);
        assert_eq!(
            outcome.recommended_primary_url.as_deref(),
            Some("https://acme.example/pricing")
        );
    }

    #[test]
    fn off_domain_and_non_http_anchors_are_dropped() {
        let outcome = discover(
            r##"<a href="https://other.example/pricing">Pricing</a>
               <a href="mailto:sales@acme.example">Pricing</a>
               <a href="javascript:void(0)">Pricing</a>
               <a href="#pricing">Pricing</a>"##,
        );
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.recommended_primary_url, None);
    }

    #[test]
    fn negative_paths_and_assets_are_filtered() {
        let outcome = discover(
            r#"<a href="/blog/pricing-news">Pricing</a>
               <a href="/assets/pricing.png">Pricing</a>
               <a href="/docs/plans">Plans</a>"#,
        );
        assert!(outcome.candidates.is_empty());
    }

    #[test]
    fn negative_anchor_text_disqualifies_a_pricing_path() {
        let outcome = discover(
            r#"<a href="/pricing">Pricing on our blog</a>
               <a href="/pricing-history">Login</a>"#,
        );
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.recommended_primary_url, None);
    }

    #[test]
    fn ambiguous_winners_are_not_recommended() {
        let outcome = discover(
            r#"<a href="/pricing">Pricing</a>
               <a href="/plans">Pricing</a>"#,
        );
        assert_eq!(outcome.candidates.len(), 2);
        // Top scores 1.00, runner-up 0.85+0.42+0.08 clamped... both saturate
        // the clamp, so the gap rule refuses to pick a primary.
        assert_eq!(outcome.recommended_primary_url, None);
    }

    #[test]
    fn zero_qualifying_anchors_is_empty_not_error() {
        let outcome = discover(r#"<p>no links here</p>"#);
        assert_eq!(outcome, DiscoveryOutcome::default());
    }

    #[test]
    fn keeps_at_most_eight_candidates() {
        let mut html = String::new();
        for i in 0..12 {
            html.push_str(&format!(r#"<a href="/pricing/tier-{i}">Pricing</a>"#));
        }
        let outcome = discover(&html);
        assert_eq!(outcome.candidates.len(), 8);
    }

    #[test]
    fn merge_is_commutative_and_keeps_max_confidence() {
        let a = vec![PricingCandidate {
            url: "https://acme.example/pricing".into(),
            confidence: 0.85,
            selected_by_user: false,
        }];
        let b = vec![
            PricingCandidate {
                url: "https://www.acme.example/pricing".into(),
                confidence: 0.60,
                selected_by_user: true,
            },
            PricingCandidate {
                url: "https://acme.example/plans".into(),
                confidence: 0.70,
                selected_by_user: false,
            },
        ];
        let ab = merge_candidates(&a, &b);
        let ba = merge_candidates(&b, &a);
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 2);
        assert_eq!(ab[0].url, "https://acme.example/pricing");
        assert_eq!(ab[0].confidence, 0.85);
        assert!(ab[0].selected_by_user);
        assert_eq!(ab[1].url, "https://acme.example/plans");
    }
}
