//! Deterministic ordering and rounding of pricing payloads.
//!
//! Canonical form is what gets hashed and diffed, so this must be stable:
//! `canonicalize(canonicalize(p)) == canonicalize(p)`.

use std::collections::BTreeSet;

use crate::model::{PriceMention, PricingPayload};

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Integer cents, used as the dedup/sort key so f64 ordering stays total.
pub fn cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_string_set(values: Vec<String>) -> Vec<String> {
    let set: BTreeSet<String> = values
        .into_iter()
        .map(|v| collapse_ws(&v.to_lowercase()))
        .filter(|v| !v.is_empty())
        .collect();
    set.into_iter().collect()
}

/// Produce the canonical form of a payload: normalized strings, rounded and
/// de-duplicated price mentions sorted by `(currency, period, amount)`.
pub fn canonicalize(payload: PricingPayload) -> PricingPayload {
    let page_title = payload
        .page_title
        .map(|t| collapse_ws(&t))
        .filter(|t| !t.is_empty());
    let page_description = payload
        .page_description
        .map(|d| collapse_ws(&d))
        .filter(|d| !d.is_empty());

    let mut keys: BTreeSet<(String, crate::model::BillingPeriod, i64)> = BTreeSet::new();
    for mention in payload.price_mentions {
        let currency = mention.currency.trim().to_uppercase();
        if currency.is_empty() {
            continue;
        }
        keys.insert((currency, mention.period, cents(mention.amount)));
    }
    let price_mentions = keys
        .into_iter()
        .map(|(currency, period, amount_cents)| PriceMention {
            amount: amount_cents as f64 / 100.0,
            currency,
            period,
        })
        .collect();

    PricingPayload {
        source_url: payload.source_url,
        page_title,
        page_description,
        plan_names: normalize_string_set(payload.plan_names),
        price_mentions,
        custom_pricing_hints: normalize_string_set(payload.custom_pricing_hints),
    }
}
