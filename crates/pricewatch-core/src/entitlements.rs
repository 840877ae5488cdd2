//! Plan entitlements: a pure function of user state and the plan rule table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Severity, SeverityGate, TrialStatus, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Starter,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starter" => Some(PlanTier::Starter),
            "pro" => Some(PlanTier::Pro),
            _ => None,
        }
    }
}

/// Per-tier limits. `weekly_digest` applies to paid access; trial access
/// never receives the digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRule {
    pub competitor_limit: u32,
    pub insight_severity_gate: SeverityGate,
    pub weekly_digest: bool,
}

/// The plan rule table. Tunable configuration, not logic: defaults mirror
/// the shipped plans and a YAML file can override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRules {
    pub starter: TierRule,
    pub pro: TierRule,
    /// Maps billing price tags to tiers. Unknown tags fall back to Starter.
    #[serde(default)]
    pub price_tags: BTreeMap<String, PlanTier>,
}

impl Default for PlanRules {
    fn default() -> Self {
        let mut price_tags = BTreeMap::new();
        price_tags.insert("price_starter_monthly".to_string(), PlanTier::Starter);
        price_tags.insert("price_starter_yearly".to_string(), PlanTier::Starter);
        price_tags.insert("price_pro_monthly".to_string(), PlanTier::Pro);
        price_tags.insert("price_pro_yearly".to_string(), PlanTier::Pro);
        Self {
            starter: TierRule {
                competitor_limit: 3,
                insight_severity_gate: SeverityGate::HighOnly,
                weekly_digest: true,
            },
            pro: TierRule {
                competitor_limit: 10,
                insight_severity_gate: SeverityGate::HighAndMedium,
                weekly_digest: true,
            },
            price_tags,
        }
    }
}

impl PlanRules {
    pub fn rule(&self, tier: PlanTier) -> &TierRule {
        match tier {
            PlanTier::Starter => &self.starter,
            PlanTier::Pro => &self.pro,
        }
    }

    pub fn tier_for_price_tag(&self, tag: Option<&str>) -> PlanTier {
        tag.and_then(|t| self.price_tags.get(t).copied())
            .unwrap_or(PlanTier::Starter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSource {
    Paid,
    Trial,
    None,
}

/// Resolved entitlements for one user at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlements {
    pub access_source: AccessSource,
    pub plan_tier: Option<PlanTier>,
    pub competitor_limit: u32,
    pub insight_severity_gate: Option<SeverityGate>,
    pub can_receive_weekly_digest: bool,
}

impl Entitlements {
    pub fn has_access(&self) -> bool {
        self.access_source != AccessSource::None
    }

    fn none() -> Self {
        Self {
            access_source: AccessSource::None,
            plan_tier: None,
            competitor_limit: 0,
            insight_severity_gate: None,
            can_receive_weekly_digest: false,
        }
    }
}

fn trial_is_running(user: &User, now: DateTime<Utc>) -> bool {
    user.trial_status == TrialStatus::Active
        && user.trial_ends_at.map(|ends| ends > now).unwrap_or(false)
}

/// Resolve entitlements. Paid access wins over an active trial; trial access
/// is forced to Starter with no digest; everything else has no access.
pub fn resolve_entitlements(user: &User, rules: &PlanRules, now: DateTime<Utc>) -> Entitlements {
    if user.has_paid_access {
        let tier = rules.tier_for_price_tag(user.paid_plan_price_tag.as_deref());
        let rule = rules.rule(tier);
        return Entitlements {
            access_source: AccessSource::Paid,
            plan_tier: Some(tier),
            competitor_limit: rule.competitor_limit,
            insight_severity_gate: Some(rule.insight_severity_gate),
            can_receive_weekly_digest: rule.weekly_digest,
        };
    }
    if trial_is_running(user, now) {
        let rule = rules.rule(PlanTier::Starter);
        return Entitlements {
            access_source: AccessSource::Trial,
            plan_tier: Some(PlanTier::Starter),
            competitor_limit: rule.competitor_limit,
            insight_severity_gate: Some(rule.insight_severity_gate),
            can_receive_weekly_digest: false,
        };
    }
    Entitlements::none()
}

/// The idempotent trial refresh: returns the transition to persist before
/// resolving, if any.
pub fn trial_refresh(user: &User, now: DateTime<Utc>) -> Option<TrialStatus> {
    if user.trial_status != TrialStatus::Active {
        return None;
    }
    if user.has_paid_access {
        return Some(TrialStatus::Converted);
    }
    match user.trial_ends_at {
        Some(ends) if ends <= now => Some(TrialStatus::Expired),
        // An active trial without an end date violates the invariant; expire
        // it rather than granting open-ended access.
        None => Some(TrialStatus::Expired),
        _ => None,
    }
}

pub fn can_generate_insight(entitlements: &Entitlements, severity: Severity) -> bool {
    entitlements.has_access()
        && entitlements
            .insight_severity_gate
            .map(|gate| gate.allows(severity))
            .unwrap_or(false)
}
