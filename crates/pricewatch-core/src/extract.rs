//! Pricing-page parsing: price mentions, plan names, signal tokens and the
//! confidence score. Pure text/HTML in, canonical payload out; transport
//! and failure classification live in the crawl crate.

use std::sync::LazyLock;

use regex::Regex;

use crate::canonical::{canonicalize, round2};
use crate::model::{is_verified, BillingPeriod, PriceMention, PricingPayload};
use crate::normalize::strip_html_to_text;

/// Phrases that indicate the fetch hit a bot wall rather than a pricing page.
const BOT_BLOCK_TOKENS: &[&str] = &[
    "captcha",
    "cloudflare",
    "access denied",
    "attention required",
    "verify you are human",
    "bot detection",
    "temporarily blocked",
];

const PRICING_SIGNAL_TOKENS: &[&str] = &[
    "pricing",
    "plans",
    "per month",
    "monthly",
    "yearly",
    "annual",
    "billed",
    "free trial",
];

const CUSTOM_PRICING_TOKENS: &[&str] = &[
    "contact sales",
    "custom pricing",
    "talk to sales",
    "enterprise pricing",
    "request a quote",
    "book a demo",
];

static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:(USD|EUR|GBP|CAD|AUD|JPY)\s+)?([$€£¥])?\s*([0-9]{1,3}(?:,[0-9]{3})+(?:\.[0-9]{1,2})?|[0-9]+(?:\.[0-9]{1,2})?)\s*(?:/\s*(day|week|wk|mo|month|yr|year)\b|per\s+(day|week|month|year)\b|(daily|weekly|monthly|yearly|annually|annual|once|one[ -]?time)\b)?",
    )
    .unwrap()
});

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h[1-5][^>]*>(.*?)</h[1-5]>").unwrap());
static PLAN_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)plan|pricing|starter|pro|business|enterprise").unwrap());
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static META_DESCRIPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<meta[^>]+name\s*=\s*["']description["'][^>]*content\s*=\s*["']([^"']*)["']"#)
        .unwrap()
});

const MAX_PLAN_NAME_LEN: usize = 80;

/// Result of parsing one page. `has_signals == false` means the page showed
/// no pricing evidence at all and the crawl should end as `manual_needed`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    pub payload: PricingPayload,
    pub confidence: f64,
    pub is_verified: bool,
    pub has_signals: bool,
}

/// True when the visible text trips the bot-block dictionary.
pub fn looks_bot_blocked(text: &str) -> bool {
    let lower = text.to_lowercase();
    BOT_BLOCK_TOKENS.iter().any(|token| lower.contains(token))
}

fn symbol_currency(symbol: &str) -> Option<&'static str> {
    match symbol {
        "$" => Some("USD"),
        "€" => Some("EUR"),
        "£" => Some("GBP"),
        "¥" => Some("JPY"),
        _ => None,
    }
}

fn period_from_token(token: &str) -> BillingPeriod {
    match token.to_lowercase().as_str() {
        "day" | "daily" => BillingPeriod::Day,
        "week" | "wk" | "weekly" => BillingPeriod::Week,
        "mo" | "month" | "monthly" => BillingPeriod::Month,
        "yr" | "year" | "yearly" | "annually" | "annual" => BillingPeriod::Year,
        "once" | "one time" | "one-time" | "onetime" => BillingPeriod::OneTime,
        _ => BillingPeriod::Unknown,
    }
}

/// Scan visible text for price mentions. Matches without a currency marker
/// (ISO code or symbol) are ignored so bare numbers never count as prices;
/// non-positive amounts are discarded.
pub fn scan_price_mentions(text: &str) -> Vec<PriceMention> {
    let mut mentions = Vec::new();
    for caps in PRICE_RE.captures_iter(text) {
        let iso = caps.get(1).map(|m| m.as_str().to_uppercase());
        let symbol = caps.get(2).and_then(|m| symbol_currency(m.as_str()));
        let currency = match (iso, symbol) {
            (Some(code), _) => code,
            (None, Some(code)) => code.to_string(),
            (None, None) => continue,
        };
        let raw_amount = caps.get(3).map(|m| m.as_str().replace(',', "")).unwrap_or_default();
        let Ok(amount) = raw_amount.parse::<f64>() else {
            continue;
        };
        let amount = round2(amount);
        if amount <= 0.0 {
            continue;
        }
        let period = caps
            .get(4)
            .or_else(|| caps.get(5))
            .or_else(|| caps.get(6))
            .map(|m| period_from_token(m.as_str()))
            .unwrap_or(BillingPeriod::Unknown);
        mentions.push(PriceMention {
            amount,
            currency,
            period,
        });
    }
    mentions
}

fn matched_tokens(lower_text: &str, tokens: &[&str]) -> Vec<String> {
    tokens
        .iter()
        .filter(|token| lower_text.contains(*token))
        .map(|token| token.to_string())
        .collect()
}

/// Plan-name candidates from `<h1>`..`<h5>` headings that look plan-like.
pub fn scan_plan_names(html: &str) -> Vec<String> {
    let mut names = Vec::new();
    for caps in HEADING_RE.captures_iter(html) {
        let inner = strip_html_to_text(caps.get(1).map(|m| m.as_str()).unwrap_or(""));
        if inner.is_empty() || !PLAN_HEADING_RE.is_match(&inner) {
            continue;
        }
        let bounded: String = inner.chars().take(MAX_PLAN_NAME_LEN).collect();
        names.push(bounded);
    }
    names
}

fn first_capture(re: &Regex, html: &str) -> Option<String> {
    re.captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| strip_html_to_text(m.as_str()))
        .filter(|s| !s.is_empty())
}

/// Parse a fetched pricing page into a canonical payload with a confidence
/// score. `source_url` should already be normalized.
pub fn parse_pricing_page(html: &str, source_url: &str) -> ParsedPage {
    let text = strip_html_to_text(html);
    let lower = text.to_lowercase();

    let price_mentions = scan_price_mentions(&text);
    let pricing_signals = matched_tokens(&lower, PRICING_SIGNAL_TOKENS);
    let custom_hints = matched_tokens(&lower, CUSTOM_PRICING_TOKENS);
    let plan_names = scan_plan_names(html);

    let confidence = if price_mentions.len() >= 3 {
        0.90
    } else if !price_mentions.is_empty() {
        if pricing_signals.is_empty() {
            0.72
        } else {
            0.78
        }
    } else if !custom_hints.is_empty() {
        0.45
    } else if !pricing_signals.is_empty() {
        0.40
    } else {
        0.0
    };
    let has_signals = confidence > 0.0;

    let payload = canonicalize(PricingPayload {
        source_url: source_url.to_string(),
        page_title: first_capture(&TITLE_RE, html),
        page_description: first_capture(&META_DESCRIPTION_RE, html),
        plan_names,
        price_mentions,
        custom_pricing_hints: custom_hints,
    });

    ParsedPage {
        is_verified: is_verified(confidence, payload.price_mentions.len()),
        payload,
        confidence,
        has_signals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_symbol_iso_and_period_forms() {
        let mentions = scan_price_mentions(
            "Starter $19 / month, Pro USD 1,299.99 yearly, Team €49 per month, Lifetime ¥10000 once",
        );
        let got: Vec<(String, BillingPeriod, f64)> = mentions
            .iter()
            .map(|m| (m.currency.clone(), m.period, m.amount))
            .collect();
        assert_eq!(
            got,
            vec![
                ("USD".to_string(), BillingPeriod::Month, 19.0),
                ("USD".to_string(), BillingPeriod::Year, 1299.99),
                ("EUR".to_string(), BillingPeriod::Month, 49.0),
                ("JPY".to_string(), BillingPeriod::OneTime, 10000.0),
            ]
        );
    }

    #[test]
    fn bare_numbers_and_non_positive_amounts_are_not_prices() {
        assert!(scan_price_mentions("Founded in 2019 with 500 customers").is_empty());
        assert!(scan_price_mentions("$0 down, $0.00 today").is_empty());
    }

    #[test]
    fn period_defaults_to_unknown() {
        let mentions = scan_price_mentions("One seat costs $25 for now");
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].period, BillingPeriod::Unknown);
    }

    #[test]
    fn plan_names_come_from_plan_like_headings_only() {
        let html = r#"
            <h1>Acme</h1>
            <h2>Simple pricing</h2>
            <h3>Starter</h3>
            <h3><span>Pro</span></h3>
            <h4>Our story</h4>
        "#;
        assert_eq!(
            scan_plan_names(html),
            vec!["Simple pricing", "Starter", "Pro"]
        );
    }

    #[test]
    fn bot_block_dictionary_hits() {
        assert!(looks_bot_blocked("Attention Required! | Cloudflare"));
        assert!(looks_bot_blocked("please verify you are human"));
        assert!(!looks_bot_blocked("Pricing plans for every team"));
    }

    #[test]
    fn three_mentions_score_high_confidence() {
        let html = "<h2>Pricing</h2><p>$9 / month $29 / month $99 / month</p>";
        let parsed = parse_pricing_page(html, "https://acme.example/pricing");
        assert_eq!(parsed.confidence, 0.90);
        assert!(parsed.is_verified);
        assert_eq!(parsed.payload.price_mentions.len(), 3);
    }

    #[test]
    fn mentions_with_signals_score_verified() {
        let html = "<h3>Starter</h3> $19 / month <h3>Pro</h3> $49 per month Free trial pricing plans";
        let parsed = parse_pricing_page(html, "https://acme.example/pricing");
        assert_eq!(parsed.confidence, 0.78);
        assert!(parsed.is_verified);
        assert_eq!(parsed.payload.price_mentions.len(), 2);
        assert_eq!(parsed.payload.plan_names, vec!["pro", "starter"]);
    }

    #[test]
    fn custom_pricing_only_scores_low_unverified() {
        let parsed = parse_pricing_page(
            "<p>Enterprise? Contact sales for a quote.</p>",
            "https://acme.example/enterprise",
        );
        assert_eq!(parsed.confidence, 0.45);
        assert!(!parsed.is_verified);
        assert!(parsed.has_signals);
        assert_eq!(parsed.payload.custom_pricing_hints, vec!["contact sales"]);
    }

    #[test]
    fn no_signals_at_all_reports_zero_confidence() {
        let parsed = parse_pricing_page("<p>We build widgets.</p>", "https://acme.example/");
        assert_eq!(parsed.confidence, 0.0);
        assert!(!parsed.has_signals);
        assert!(!parsed.is_verified);
    }

    #[test]
    fn title_and_description_are_extracted() {
        let html = r#"<html><head><title> Acme — Pricing </title>
            <meta name="description" content="Plans from $9"></head>
            <body>$9 / month pricing</body></html>"#;
        let parsed = parse_pricing_page(html, "https://acme.example/pricing");
        assert_eq!(parsed.payload.page_title.as_deref(), Some("Acme — Pricing"));
        assert_eq!(parsed.payload.page_description.as_deref(), Some("Plans from $9"));
    }
}
