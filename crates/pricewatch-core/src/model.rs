//! Domain entities for the pricewatch crawl core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trial lifecycle of a user. Owned by the billing collaborator; the core
/// only performs the idempotent refresh transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    NotStarted,
    Active,
    Expired,
    Converted,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::NotStarted => "not_started",
            TrialStatus::Active => "active",
            TrialStatus::Expired => "expired",
            TrialStatus::Converted => "converted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(TrialStatus::NotStarted),
            "active" => Some(TrialStatus::Active),
            "expired" => Some(TrialStatus::Expired),
            "converted" => Some(TrialStatus::Converted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub paid_plan_price_tag: Option<String>,
    pub has_paid_access: bool,
    pub trial_status: TrialStatus,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub last_digest_sent_at: Option<DateTime<Utc>>,
}

/// Whether a company record is the user's own company or a tracked competitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyKind {
    #[serde(rename = "self")]
    SelfCompany,
    Competitor,
}

impl CompanyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompanyKind::SelfCompany => "self",
            CompanyKind::Competitor => "competitor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "self" => Some(CompanyKind::SelfCompany),
            "competitor" => Some(CompanyKind::Competitor),
            _ => None,
        }
    }
}

/// Terminal status of the most recent crawl attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Idle,
    Ok,
    Blocked,
    ManualNeeded,
    Error,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Idle => "idle",
            CrawlStatus::Ok => "ok",
            CrawlStatus::Blocked => "blocked",
            CrawlStatus::ManualNeeded => "manual_needed",
            CrawlStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(CrawlStatus::Idle),
            "ok" => Some(CrawlStatus::Ok),
            "blocked" => Some(CrawlStatus::Blocked),
            "manual_needed" => Some(CrawlStatus::ManualNeeded),
            "error" => Some(CrawlStatus::Error),
            _ => None,
        }
    }
}

/// A scored pricing-page candidate discovered on a company homepage or
/// supplied by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingCandidate {
    pub url: String,
    pub confidence: f64,
    pub selected_by_user: bool,
}

/// A crawl target. Scheduling fields (`next_crawl_at`, `crawl_lease_until`)
/// drive the lease claimer; observation fields are written by the runner's
/// finalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub company_id: Uuid,
    pub user_id: Uuid,
    pub kind: CompanyKind,
    pub name: String,
    pub domain: String,
    pub homepage_url: Option<String>,
    pub primary_pricing_url: Option<String>,
    pub pricing_url_candidates: Vec<PricingCandidate>,
    pub next_crawl_at: Option<DateTime<Utc>>,
    pub crawl_lease_until: Option<DateTime<Utc>>,
    pub last_crawl_at: Option<DateTime<Utc>>,
    pub last_crawl_status: CrawlStatus,
    pub last_crawl_error: Option<String>,
    pub latest_content_hash: Option<String>,
    pub latest_confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Billing period attached to a price mention. Variant order is the sort
/// order inside canonical payloads and diff buckets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Day,
    Week,
    Month,
    Year,
    OneTime,
    Unknown,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Day => "day",
            BillingPeriod::Week => "week",
            BillingPeriod::Month => "month",
            BillingPeriod::Year => "year",
            BillingPeriod::OneTime => "one_time",
            BillingPeriod::Unknown => "unknown",
        }
    }
}

/// One observed price: 2-dp amount, uppercase ISO-ish currency, period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceMention {
    pub amount: f64,
    pub currency: String,
    pub period: BillingPeriod,
}

/// Extracted pricing-page content. Canonical by construction: plan names and
/// hints lowercased/deduped/sorted, mentions deduped by
/// `(currency, period, amount)` and sorted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingPayload {
    pub source_url: String,
    pub page_title: Option<String>,
    pub page_description: Option<String>,
    pub plan_names: Vec<String>,
    pub price_mentions: Vec<PriceMention>,
    pub custom_pricing_hints: Vec<String>,
}

/// How a snapshot was captured. Only `Static` is produced today; the other
/// variants are reserved for future capture backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    Static,
    Playwright,
    Llm,
    Manual,
}

impl CaptureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMethod::Static => "static",
            CaptureMethod::Playwright => "playwright",
            CaptureMethod::Llm => "llm",
            CaptureMethod::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "static" => Some(CaptureMethod::Static),
            "playwright" => Some(CaptureMethod::Playwright),
            "llm" => Some(CaptureMethod::Llm),
            "manual" => Some(CaptureMethod::Manual),
            _ => None,
        }
    }
}

/// Minimum extraction confidence for a snapshot to count as verified.
pub const VERIFIED_MIN_CONFIDENCE: f64 = 0.75;

/// Verification rule shared by the extractor and the snapshot invariant:
/// verified ⇔ confidence ≥ 0.75 and at least one price mention.
pub fn is_verified(confidence: f64, price_mention_count: usize) -> bool {
    confidence >= VERIFIED_MIN_CONFIDENCE && price_mention_count > 0
}

/// One immutable observation of a pricing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: Uuid,
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub capture_method: CaptureMethod,
    pub confidence: f64,
    pub content_hash: String,
    pub payload: PricingPayload,
    pub is_verified: bool,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Verified,
    Unverified,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Verified => "verified",
            VerificationState::Unverified => "unverified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "verified" => Some(VerificationState::Verified),
            "unverified" => Some(VerificationState::Unverified),
            _ => None,
        }
    }
}

/// A paired amount that moved past the noise floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub previous: f64,
    pub current: f64,
    pub abs_delta: f64,
    pub pct_delta: f64,
}

/// Delta for one `(currency, period)` bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketChange {
    pub currency: String,
    pub period: BillingPeriod,
    pub added: Vec<f64>,
    pub removed: Vec<f64>,
    pub updated: Vec<PriceUpdate>,
}

/// Bucketed, low-noise delta between two canonical payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDiff {
    pub buckets: Vec<BucketChange>,
    pub added_hints: Vec<String>,
    pub removed_hints: Vec<String>,
    pub previous_price_count: usize,
    pub current_price_count: usize,
    pub previous_plan_count: usize,
    pub current_plan_count: usize,
    pub changed_at: DateTime<Utc>,
}

/// A meaningful snapshot-to-snapshot change. Only written when the bucketed
/// delta or hint set is non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub diff_id: Uuid,
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub previous_snapshot_id: Option<Uuid>,
    pub current_snapshot_id: Uuid,
    pub normalized: NormalizedDiff,
    pub severity: Severity,
    pub verification: VerificationState,
    pub detected_at: DateTime<Utc>,
}

/// Which diff severities a plan tier may turn into insights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityGate {
    HighOnly,
    HighAndMedium,
}

impl SeverityGate {
    pub fn allows(&self, severity: Severity) -> bool {
        match self {
            SeverityGate::HighOnly => severity == Severity::High,
            SeverityGate::HighAndMedium => {
                severity == Severity::High || severity == Severity::Medium
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityGate::HighOnly => "high_only",
            SeverityGate::HighAndMedium => "high_and_medium",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high_only" => Some(SeverityGate::HighOnly),
            "high_and_medium" => Some(SeverityGate::HighAndMedium),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightFeedback {
    None,
    Helpful,
    NotHelpful,
}

impl InsightFeedback {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightFeedback::None => "none",
            InsightFeedback::Helpful => "helpful",
            InsightFeedback::NotHelpful => "not_helpful",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(InsightFeedback::None),
            "helpful" => Some(InsightFeedback::Helpful),
            "not_helpful" => Some(InsightFeedback::NotHelpful),
            _ => None,
        }
    }
}

/// Counts of price movements across all buckets of a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChangeSummary {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

/// Structured recommendation body carried by an insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub headline: String,
    pub summary: String,
    pub risk_label: String,
    pub severity: Severity,
    pub verification: VerificationState,
    pub action_items: Vec<String>,
    pub price_changes: PriceChangeSummary,
    pub bucket_lines: Vec<String>,
}

/// A decision recommendation derived from a diff, gated by entitlements.
/// Token and cost counters are zero for the deterministic rules generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub insight_id: Uuid,
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub diff_id: Uuid,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_cost_usd: f64,
    pub recommendation: Recommendation,
    pub severity_gate: SeverityGate,
    pub generated_at: DateTime<Utc>,
    pub feedback: InsightFeedback,
}

/// Single-writer guard for a named job. Free iff `lock_until <= now`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationLock {
    pub key: String,
    pub owner_id: Uuid,
    pub lock_until: DateTime<Utc>,
    pub locked_at: DateTime<Utc>,
    pub last_released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Processing,
    Processed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Processing => "processing",
            WebhookEventStatus::Processed => "processed",
            WebhookEventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(WebhookEventStatus::Processing),
            "processed" => Some(WebhookEventStatus::Processed),
            "failed" => Some(WebhookEventStatus::Failed),
            _ => None,
        }
    }
}

/// Idempotency ledger entry for billing webhook events. The billing
/// collaborator owns the processing; the core only exposes the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedWebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub status: WebhookEventStatus,
    pub attempts: u32,
    pub lock_expires_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Fixed-window counter used by interactive write endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitCounter {
    pub key: String,
    pub count: u32,
    pub window_started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Rejected,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Rejected => "rejected",
            AuditOutcome::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AuditOutcome::Success),
            "rejected" => Some(AuditOutcome::Rejected),
            "failure" => Some(AuditOutcome::Failure),
            _ => None,
        }
    }
}

/// Lifecycle audit record emitted on crawl failures and user-facing
/// mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub company_id: Option<Uuid>,
    pub action: String,
    pub outcome: AuditOutcome,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
