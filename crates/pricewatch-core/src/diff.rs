//! Bucketed delta between two canonical payloads with severity assignment.
//!
//! Amounts are paired positionally within a `(currency, period)` bucket and
//! movements under the noise floor (abs < 0.50 or < 1%) are discarded, so a
//! written diff is always a meaningful-change signal.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::canonical::round2;
use crate::model::{
    BillingPeriod, BucketChange, NormalizedDiff, PriceUpdate, PricingPayload, Severity,
    VerificationState,
};

/// Minimum absolute movement for a paired amount to count as updated.
pub const MIN_ABS_DELTA: f64 = 0.50;
/// Minimum percentage movement for a paired amount to count as updated.
pub const MIN_PCT_DELTA: f64 = 1.0;

const HIGH_PCT_THRESHOLD: f64 = 20.0;
const MEDIUM_PCT_THRESHOLD: f64 = 10.0;

/// A computed, non-empty delta. The runner attaches ids and persists it.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedDiff {
    pub normalized: NormalizedDiff,
    pub severity: Severity,
    pub verification: VerificationState,
}

fn bucket_amounts(
    payload: &PricingPayload,
) -> BTreeMap<(String, BillingPeriod), Vec<f64>> {
    let mut buckets: BTreeMap<(String, BillingPeriod), Vec<f64>> = BTreeMap::new();
    for mention in &payload.price_mentions {
        buckets
            .entry((mention.currency.clone(), mention.period))
            .or_default()
            .push(mention.amount);
    }
    buckets
}

fn set_difference(a: &[String], b: &[String]) -> Vec<String> {
    let b_set: BTreeSet<&String> = b.iter().collect();
    a.iter().filter(|v| !b_set.contains(v)).cloned().collect()
}

/// Compare two canonical payloads. Returns `None` when nothing moved past
/// the noise floor and the custom-pricing hints are unchanged.
pub fn compute_diff(
    previous: &PricingPayload,
    current: &PricingPayload,
    current_verified: bool,
    now: DateTime<Utc>,
) -> Option<ComputedDiff> {
    let prev_buckets = bucket_amounts(previous);
    let curr_buckets = bucket_amounts(current);
    let keys: BTreeSet<(String, BillingPeriod)> = prev_buckets
        .keys()
        .chain(curr_buckets.keys())
        .cloned()
        .collect();

    let empty: Vec<f64> = Vec::new();
    let mut buckets = Vec::new();
    let mut max_pct: f64 = 0.0;
    let mut added_total = 0usize;
    let mut removed_total = 0usize;
    let mut updated_total = 0usize;

    for key in keys {
        let prev = prev_buckets.get(&key).unwrap_or(&empty);
        let curr = curr_buckets.get(&key).unwrap_or(&empty);
        let paired = prev.len().min(curr.len());

        let mut updated = Vec::new();
        for i in 0..paired {
            let abs_delta = (curr[i] - prev[i]).abs();
            let pct_delta = if prev[i] == 0.0 {
                100.0
            } else {
                abs_delta / prev[i] * 100.0
            };
            if abs_delta >= MIN_ABS_DELTA && pct_delta >= MIN_PCT_DELTA {
                max_pct = max_pct.max(pct_delta);
                updated.push(PriceUpdate {
                    previous: prev[i],
                    current: curr[i],
                    abs_delta: round2(abs_delta),
                    pct_delta: round2(pct_delta),
                });
            }
        }
        let removed: Vec<f64> = prev[paired..].to_vec();
        let added: Vec<f64> = curr[paired..].to_vec();

        if updated.is_empty() && removed.is_empty() && added.is_empty() {
            continue;
        }
        added_total += added.len();
        removed_total += removed.len();
        updated_total += updated.len();
        buckets.push(BucketChange {
            currency: key.0,
            period: key.1,
            added,
            removed,
            updated,
        });
    }

    let added_hints = set_difference(&current.custom_pricing_hints, &previous.custom_pricing_hints);
    let removed_hints =
        set_difference(&previous.custom_pricing_hints, &current.custom_pricing_hints);
    let hint_change = !added_hints.is_empty() || !removed_hints.is_empty();

    if buckets.is_empty() && !hint_change {
        return None;
    }

    let total_changes = added_total + removed_total + updated_total;
    let severity = if max_pct >= HIGH_PCT_THRESHOLD || (added_total >= 2 && removed_total >= 2) {
        Severity::High
    } else if max_pct >= MEDIUM_PCT_THRESHOLD || total_changes >= 2 || hint_change {
        Severity::Medium
    } else {
        Severity::Low
    };

    Some(ComputedDiff {
        normalized: NormalizedDiff {
            buckets,
            added_hints,
            removed_hints,
            previous_price_count: previous.price_mentions.len(),
            current_price_count: current.price_mentions.len(),
            previous_plan_count: previous.plan_names.len(),
            current_plan_count: current.plan_names.len(),
            changed_at: now,
        },
        severity,
        verification: if current_verified {
            VerificationState::Verified
        } else {
            VerificationState::Unverified
        },
    })
}
