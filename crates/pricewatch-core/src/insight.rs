//! Rules-based insight generation, gated by entitlements.

use crate::entitlements::{can_generate_insight, Entitlements};
use crate::model::{
    NormalizedDiff, PriceChangeSummary, Recommendation, Severity, SeverityGate, VerificationState,
};

/// Generator label recorded on every insight this module produces.
pub const RULES_MODEL: &str = "rules-v1";

/// Create-input for an insight; ids and timestamps are attached by the
/// caller when persisting.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInsight {
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_cost_usd: f64,
    pub recommendation: Recommendation,
    pub severity_gate: SeverityGate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsightDecision {
    Create(Box<NewInsight>),
    Skip(&'static str),
}

/// Counts of price movements across every bucket of a diff.
pub fn summarize_price_changes(normalized: &NormalizedDiff) -> PriceChangeSummary {
    let mut summary = PriceChangeSummary::default();
    for bucket in &normalized.buckets {
        summary.added += bucket.added.len();
        summary.removed += bucket.removed.len();
        summary.updated += bucket.updated.len();
    }
    summary
}

fn bucket_lines(normalized: &NormalizedDiff) -> Vec<String> {
    normalized
        .buckets
        .iter()
        .map(|bucket| {
            format!(
                "{}/{}: {} added, {} removed, {} updated",
                bucket.currency,
                bucket.period.as_str(),
                bucket.added.len(),
                bucket.removed.len(),
                bucket.updated.len()
            )
        })
        .collect()
}

fn action_items(
    severity: Severity,
    verification: VerificationState,
    normalized: &NormalizedDiff,
) -> Vec<String> {
    let mut items = vec!["Compare the changed plans against your current price list.".to_string()];
    match severity {
        Severity::High => items.push(
            "Review competitor positioning and update your pricing strategy within 24 hours."
                .to_string(),
        ),
        Severity::Medium => {
            items.push("Schedule a pricing review with your team this week.".to_string())
        }
        Severity::Low => {}
    }
    if verification == VerificationState::Unverified {
        items.push(
            "Manually verify the competitor pricing page before acting on this change.".to_string(),
        );
    }
    if !normalized.added_hints.is_empty() {
        items.push(
            "Investigate the new custom-pricing signals on the competitor page.".to_string(),
        );
    }
    items
}

/// Decide whether a diff becomes an insight for this owner, and build the
/// recommendation if so. Token and cost counters stay zero for the rules
/// generator; the fields exist for a future LLM backend.
pub fn build_insight(
    entitlements: &Entitlements,
    severity: Severity,
    verification: VerificationState,
    normalized: &NormalizedDiff,
) -> InsightDecision {
    let Some(gate) = entitlements.insight_severity_gate else {
        return InsightDecision::Skip("no_access");
    };
    if !can_generate_insight(entitlements, severity) {
        return InsightDecision::Skip("severity_below_gate");
    }

    let changes = summarize_price_changes(normalized);
    let hint_note = if normalized.added_hints.is_empty() && normalized.removed_hints.is_empty() {
        String::new()
    } else {
        format!(
            " Custom-pricing signals changed ({} added, {} removed).",
            normalized.added_hints.len(),
            normalized.removed_hints.len()
        )
    };
    let summary = format!(
        "Detected {} updated, {} new and {} removed price points across {} currency/period buckets.{}",
        changes.updated,
        changes.added,
        changes.removed,
        normalized.buckets.len(),
        hint_note
    );

    InsightDecision::Create(Box::new(NewInsight {
        model: RULES_MODEL.to_string(),
        prompt_tokens: 0,
        completion_tokens: 0,
        total_cost_usd: 0.0,
        recommendation: Recommendation {
            headline: format!("{} severity competitor pricing change", severity.as_str()),
            summary,
            risk_label: severity.as_str().to_string(),
            severity,
            verification,
            action_items: action_items(severity, verification, normalized),
            price_changes: changes,
            bucket_lines: bucket_lines(normalized),
        },
        severity_gate: gate,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::{resolve_entitlements, PlanRules};
    use crate::model::{BillingPeriod, BucketChange, PriceUpdate, TrialStatus, User};
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn normalized() -> NormalizedDiff {
        NormalizedDiff {
            buckets: vec![BucketChange {
                currency: "USD".into(),
                period: BillingPeriod::Month,
                added: vec![],
                removed: vec![],
                updated: vec![PriceUpdate {
                    previous: 49.0,
                    current: 59.0,
                    abs_delta: 10.0,
                    pct_delta: 20.41,
                }],
            }],
            added_hints: vec![],
            removed_hints: vec![],
            previous_price_count: 2,
            current_price_count: 2,
            previous_plan_count: 2,
            current_plan_count: 2,
            changed_at: at("2026-03-01T09:00:00Z"),
        }
    }

    fn paid_user(tag: &str) -> User {
        User {
            user_id: Uuid::new_v4(),
            email: None,
            paid_plan_price_tag: Some(tag.into()),
            has_paid_access: true,
            trial_status: TrialStatus::Converted,
            trial_started_at: None,
            trial_ends_at: None,
            last_digest_sent_at: None,
        }
    }

    #[test]
    fn high_verified_diff_creates_insight_for_starter() {
        let ent = resolve_entitlements(
            &paid_user("price_starter_monthly"),
            &PlanRules::default(),
            at("2026-03-01T00:00:00Z"),
        );
        let decision = build_insight(
            &ent,
            Severity::High,
            VerificationState::Verified,
            &normalized(),
        );
        let InsightDecision::Create(insight) = decision else {
            panic!("expected insight");
        };
        assert_eq!(insight.model, RULES_MODEL);
        assert_eq!(insight.prompt_tokens, 0);
        assert_eq!(insight.total_cost_usd, 0.0);
        assert_eq!(insight.severity_gate, SeverityGate::HighOnly);
        assert!(insight
            .recommendation
            .action_items
            .iter()
            .any(|a| a.contains("within 24 hours")));
        assert_eq!(insight.recommendation.price_changes.updated, 1);
        assert_eq!(
            insight.recommendation.bucket_lines,
            vec!["USD/month: 0 added, 0 removed, 1 updated"]
        );
    }

    #[test]
    fn medium_diff_is_skipped_below_starter_gate() {
        let ent = resolve_entitlements(
            &paid_user("price_starter_monthly"),
            &PlanRules::default(),
            at("2026-03-01T00:00:00Z"),
        );
        assert_eq!(
            build_insight(
                &ent,
                Severity::Medium,
                VerificationState::Verified,
                &normalized()
            ),
            InsightDecision::Skip("severity_below_gate")
        );
    }

    #[test]
    fn unverified_diff_adds_manual_verification_step() {
        let ent = resolve_entitlements(
            &paid_user("price_pro_monthly"),
            &PlanRules::default(),
            at("2026-03-01T00:00:00Z"),
        );
        let InsightDecision::Create(insight) = build_insight(
            &ent,
            Severity::Medium,
            VerificationState::Unverified,
            &normalized(),
        ) else {
            panic!("expected insight");
        };
        assert!(insight
            .recommendation
            .action_items
            .iter()
            .any(|a| a.contains("Manually verify")));
    }

    #[test]
    fn no_access_skips_with_reason() {
        let mut user = paid_user("price_pro_monthly");
        user.has_paid_access = false;
        user.trial_status = TrialStatus::Expired;
        let ent =
            resolve_entitlements(&user, &PlanRules::default(), at("2026-03-01T00:00:00Z"));
        assert_eq!(
            build_insight(
                &ent,
                Severity::High,
                VerificationState::Verified,
                &normalized()
            ),
            InsightDecision::Skip("no_access")
        );
    }
}
