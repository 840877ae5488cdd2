//! Core domain model and pure pipeline stages for pricewatch: URL/HTML
//! normalization, pricing extraction, canonicalization, diffing,
//! entitlements, insight generation, and pricing-URL discovery scoring.
//!
//! Everything here is side-effect free; transport and persistence live in
//! the storage and crawl crates.

pub mod canonical;
pub mod diff;
pub mod discovery;
pub mod entitlements;
pub mod extract;
pub mod insight;
pub mod model;
pub mod normalize;

pub const CRATE_NAME: &str = "pricewatch-core";

pub use canonical::{canonicalize, round2};
pub use diff::{compute_diff, ComputedDiff};
pub use discovery::{merge_candidates, score_pricing_links, DiscoveryConfig, DiscoveryOutcome};
pub use entitlements::{
    can_generate_insight, resolve_entitlements, trial_refresh, AccessSource, Entitlements,
    PlanRules, PlanTier, TierRule,
};
pub use extract::{looks_bot_blocked, parse_pricing_page, ParsedPage};
pub use insight::{build_insight, summarize_price_changes, InsightDecision, NewInsight};
pub use model::*;
pub use normalize::{
    content_hash, matches_domain, normalize_domain, normalize_html_for_hash, normalize_url,
    strip_html_to_text,
};
