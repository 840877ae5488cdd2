//! Persistence contract for the crawl core.
//!
//! Every mutating operation is a single atomic step from the caller's point
//! of view: the in-memory backend serializes on one mutex, the Postgres
//! backend uses single-statement updates. That is what makes the lease
//! claimer and the invocation lock safe under concurrent invocations.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pricewatch_core::model::{
    AuditEvent, Company, CrawlStatus, Diff, Insight, PricingCandidate, Snapshot, TrialStatus, User,
};
use uuid::Uuid;

/// Result of trying to take a named invocation lock.
#[derive(Debug, Clone, PartialEq)]
pub enum LockAcquire {
    Acquired {
        owner_id: Uuid,
        lock_until: DateTime<Utc>,
    },
    Held {
        lock_until: DateTime<Utc>,
        retry_after_seconds: i64,
    },
}

/// Everything the runner's finalizer writes back to a company in one shot.
/// `None` on hash/confidence/candidates means "leave as is"; `None` on the
/// error clears it.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlFinalize {
    pub last_crawl_status: CrawlStatus,
    pub next_crawl_at: DateTime<Utc>,
    pub last_crawl_error: Option<String>,
    pub latest_content_hash: Option<String>,
    pub latest_confidence: Option<f64>,
    pub merged_candidates: Option<Vec<PricingCandidate>>,
    /// Set as primary only when the company has none yet.
    pub discovered_primary_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertCompanyOutcome {
    Inserted,
    DuplicateSelf,
    DuplicateDomain,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrawlNowOutcome {
    Scheduled,
    LeaseActive { lease_until: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookClaim {
    Claimed,
    AlreadyProcessed,
    InFlight,
}

/// Storage contract shared by the in-memory and Postgres backends.
#[async_trait]
pub trait Store: Send + Sync {
    // -- users -------------------------------------------------------------
    async fn insert_user(&self, user: &User) -> Result<()>;
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>>;
    async fn list_users(&self) -> Result<Vec<User>>;
    /// Compare-and-set trial transition. Returns false when the user's
    /// current status no longer matches `from`.
    async fn transition_trial(
        &self,
        user_id: Uuid,
        from: TrialStatus,
        to: TrialStatus,
        started_at: Option<DateTime<Utc>>,
        ends_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;
    async fn set_last_digest_sent_at(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    // -- companies ---------------------------------------------------------
    async fn insert_company(&self, company: &Company) -> Result<InsertCompanyOutcome>;
    async fn get_company(&self, company_id: Uuid) -> Result<Option<Company>>;
    async fn list_companies(&self, user_id: Uuid) -> Result<Vec<Company>>;
    async fn count_competitors(&self, user_id: Uuid) -> Result<u32>;
    /// Atomically lease the oldest due competitor, if any.
    async fn claim_due_company(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Company>>;
    /// The per-item finalizer write: always clears the lease.
    async fn finalize_crawl(
        &self,
        company_id: Uuid,
        now: DateTime<Utc>,
        update: CrawlFinalize,
    ) -> Result<()>;
    async fn update_candidates(
        &self,
        company_id: Uuid,
        candidates: Vec<PricingCandidate>,
        now: DateTime<Utc>,
    ) -> Result<()>;
    async fn set_primary_pricing(
        &self,
        company_id: Uuid,
        url: String,
        candidates: Vec<PricingCandidate>,
        now: DateTime<Utc>,
    ) -> Result<()>;
    /// Make a company due immediately; an unexpired lease stays untouched
    /// and is reported back.
    async fn request_crawl_now(
        &self,
        company_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CrawlNowOutcome>;

    // -- snapshots / diffs / insights --------------------------------------
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
    async fn latest_snapshot(&self, company_id: Uuid) -> Result<Option<Snapshot>>;
    async fn insert_diff(&self, diff: &Diff) -> Result<()>;
    async fn list_verified_diffs_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Diff>>;
    async fn list_recent_diffs(&self, user_id: Uuid, limit: usize) -> Result<Vec<Diff>>;
    async fn insert_insight(&self, insight: &Insight) -> Result<()>;
    async fn list_recent_insights(&self, user_id: Uuid, limit: usize) -> Result<Vec<Insight>>;

    // -- invocation locks --------------------------------------------------
    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LockAcquire>;
    /// Fenced release: only the owner's release takes effect.
    async fn release_lock(&self, key: &str, owner_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    // -- rate limiting -----------------------------------------------------
    async fn fixed_window_hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision>;

    // -- billing webhook ledger (external collaborator interface) ----------
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        lock_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<WebhookClaim>;
    async fn complete_webhook_event(&self, event_id: &str, now: DateTime<Utc>) -> Result<()>;
    async fn fail_webhook_event(
        &self,
        event_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    // -- audit -------------------------------------------------------------
    async fn record_audit(&self, event: &AuditEvent) -> Result<()>;
}
