//! In-memory store backend.
//!
//! Used by the test suites and by `serve` when no `DATABASE_URL` is set.
//! A single async mutex around the whole state gives every trait method the
//! same atomicity the Postgres backend gets from single-statement updates.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pricewatch_core::model::{
    AuditEvent, Company, Diff, Insight, InvocationLock, PricingCandidate, ProcessedWebhookEvent,
    RateLimitCounter, Snapshot, TrialStatus, User, WebhookEventStatus,
};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{
    CrawlFinalize, CrawlNowOutcome, InsertCompanyOutcome, LockAcquire, RateLimitDecision, Store,
    WebhookClaim,
};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    companies: HashMap<Uuid, Company>,
    snapshots: Vec<Snapshot>,
    diffs: Vec<Diff>,
    insights: Vec<Insight>,
    locks: HashMap<String, InvocationLock>,
    counters: HashMap<String, RateLimitCounter>,
    webhook_events: HashMap<String, ProcessedWebhookEvent>,
    audit_events: Vec<AuditEvent>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/diagnostic hook: every audit event recorded so far.
    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.inner.lock().await.audit_events.clone()
    }

    /// Test/diagnostic hook: number of stored snapshots.
    pub async fn snapshot_count(&self) -> usize {
        self.inner.lock().await.snapshots.len()
    }
}

fn company_is_due(company: &Company, now: DateTime<Utc>) -> bool {
    company.kind == pricewatch_core::model::CompanyKind::Competitor
        && company.next_crawl_at.map(|at| at <= now).unwrap_or(true)
        && company
            .crawl_lease_until
            .map(|until| until <= now)
            .unwrap_or(true)
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_user(&self, user: &User) -> Result<()> {
        self.inner
            .lock()
            .await
            .users
            .insert(user.user_id, user.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self.inner.lock().await.users.get(&user_id).cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let inner = self.inner.lock().await;
        let mut users: Vec<User> = inner.users.values().cloned().collect();
        users.sort_by_key(|u| u.user_id);
        Ok(users)
    }

    async fn transition_trial(
        &self,
        user_id: Uuid,
        from: TrialStatus,
        to: TrialStatus,
        started_at: Option<DateTime<Utc>>,
        ends_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(user) = inner.users.get_mut(&user_id) else {
            return Ok(false);
        };
        if user.trial_status != from {
            return Ok(false);
        }
        user.trial_status = to;
        if started_at.is_some() {
            user.trial_started_at = started_at;
        }
        if ends_at.is_some() {
            user.trial_ends_at = ends_at;
        }
        Ok(true)
    }

    async fn set_last_digest_sent_at(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| anyhow!("unknown user {user_id}"))?;
        user.last_digest_sent_at = Some(at);
        Ok(())
    }

    async fn insert_company(&self, company: &Company) -> Result<InsertCompanyOutcome> {
        let mut inner = self.inner.lock().await;
        let duplicate_self = company.kind == pricewatch_core::model::CompanyKind::SelfCompany
            && inner
                .companies
                .values()
                .any(|c| c.user_id == company.user_id && c.kind == company.kind);
        if duplicate_self {
            return Ok(InsertCompanyOutcome::DuplicateSelf);
        }
        let duplicate_domain = inner.companies.values().any(|c| {
            c.user_id == company.user_id && c.kind == company.kind && c.domain == company.domain
        });
        if duplicate_domain {
            return Ok(InsertCompanyOutcome::DuplicateDomain);
        }
        inner.companies.insert(company.company_id, company.clone());
        Ok(InsertCompanyOutcome::Inserted)
    }

    async fn get_company(&self, company_id: Uuid) -> Result<Option<Company>> {
        Ok(self.inner.lock().await.companies.get(&company_id).cloned())
    }

    async fn list_companies(&self, user_id: Uuid) -> Result<Vec<Company>> {
        let inner = self.inner.lock().await;
        let mut companies: Vec<Company> = inner
            .companies
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        companies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(companies)
    }

    async fn count_competitors(&self, user_id: Uuid) -> Result<u32> {
        let inner = self.inner.lock().await;
        Ok(inner
            .companies
            .values()
            .filter(|c| {
                c.user_id == user_id && c.kind == pricewatch_core::model::CompanyKind::Competitor
            })
            .count() as u32)
    }

    async fn claim_due_company(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Company>> {
        let mut inner = self.inner.lock().await;
        let next = inner
            .companies
            .values()
            .filter(|c| company_is_due(c, now))
            .min_by_key(|c| (c.next_crawl_at, c.updated_at))
            .map(|c| c.company_id);
        let Some(company_id) = next else {
            return Ok(None);
        };
        let company = inner
            .companies
            .get_mut(&company_id)
            .expect("company id from the same map");
        company.crawl_lease_until = Some(lease_until);
        company.updated_at = now;
        Ok(Some(company.clone()))
    }

    async fn finalize_crawl(
        &self,
        company_id: Uuid,
        now: DateTime<Utc>,
        update: CrawlFinalize,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let company = inner
            .companies
            .get_mut(&company_id)
            .ok_or_else(|| anyhow!("unknown company {company_id}"))?;
        company.last_crawl_at = Some(now);
        company.last_crawl_status = update.last_crawl_status;
        company.next_crawl_at = Some(update.next_crawl_at);
        company.crawl_lease_until = None;
        company.last_crawl_error = update.last_crawl_error;
        if update.latest_content_hash.is_some() {
            company.latest_content_hash = update.latest_content_hash;
        }
        if update.latest_confidence.is_some() {
            company.latest_confidence = update.latest_confidence;
        }
        if let Some(candidates) = update.merged_candidates {
            company.pricing_url_candidates = candidates;
        }
        if company.primary_pricing_url.is_none() {
            if let Some(url) = update.discovered_primary_url {
                company.primary_pricing_url = Some(url);
            }
        }
        company.updated_at = now;
        Ok(())
    }

    async fn update_candidates(
        &self,
        company_id: Uuid,
        candidates: Vec<PricingCandidate>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let company = inner
            .companies
            .get_mut(&company_id)
            .ok_or_else(|| anyhow!("unknown company {company_id}"))?;
        company.pricing_url_candidates = candidates;
        company.updated_at = now;
        Ok(())
    }

    async fn set_primary_pricing(
        &self,
        company_id: Uuid,
        url: String,
        candidates: Vec<PricingCandidate>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let company = inner
            .companies
            .get_mut(&company_id)
            .ok_or_else(|| anyhow!("unknown company {company_id}"))?;
        company.primary_pricing_url = Some(url);
        company.pricing_url_candidates = candidates;
        company.updated_at = now;
        Ok(())
    }

    async fn request_crawl_now(
        &self,
        company_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CrawlNowOutcome> {
        let mut inner = self.inner.lock().await;
        let company = inner
            .companies
            .get_mut(&company_id)
            .ok_or_else(|| anyhow!("unknown company {company_id}"))?;
        company.next_crawl_at = Some(now);
        company.updated_at = now;
        match company.crawl_lease_until {
            Some(until) if until > now => Ok(CrawlNowOutcome::LeaseActive { lease_until: until }),
            _ => {
                company.crawl_lease_until = None;
                Ok(CrawlNowOutcome::Scheduled)
            }
        }
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.inner.lock().await.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot(&self, company_id: Uuid) -> Result<Option<Snapshot>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .snapshots
            .iter()
            .filter(|s| s.company_id == company_id)
            .max_by_key(|s| s.captured_at)
            .cloned())
    }

    async fn insert_diff(&self, diff: &Diff) -> Result<()> {
        self.inner.lock().await.diffs.push(diff.clone());
        Ok(())
    }

    async fn list_verified_diffs_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Diff>> {
        let inner = self.inner.lock().await;
        let mut diffs: Vec<Diff> = inner
            .diffs
            .iter()
            .filter(|d| {
                d.user_id == user_id
                    && d.verification == pricewatch_core::model::VerificationState::Verified
                    && d.detected_at >= since
            })
            .cloned()
            .collect();
        diffs.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        diffs.truncate(limit);
        Ok(diffs)
    }

    async fn list_recent_diffs(&self, user_id: Uuid, limit: usize) -> Result<Vec<Diff>> {
        let inner = self.inner.lock().await;
        let mut diffs: Vec<Diff> = inner
            .diffs
            .iter()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        diffs.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        diffs.truncate(limit);
        Ok(diffs)
    }

    async fn insert_insight(&self, insight: &Insight) -> Result<()> {
        self.inner.lock().await.insights.push(insight.clone());
        Ok(())
    }

    async fn list_recent_insights(&self, user_id: Uuid, limit: usize) -> Result<Vec<Insight>> {
        let inner = self.inner.lock().await;
        let mut insights: Vec<Insight> = inner
            .insights
            .iter()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect();
        insights.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
        insights.truncate(limit);
        Ok(insights)
    }

    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LockAcquire> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.locks.get(key) {
            if existing.lock_until > now {
                return Ok(LockAcquire::Held {
                    lock_until: existing.lock_until,
                    retry_after_seconds: (existing.lock_until - now).num_seconds().max(1),
                });
            }
        }
        let owner_id = Uuid::new_v4();
        let lock_until = now + ttl;
        let last_released_at = inner.locks.get(key).and_then(|l| l.last_released_at);
        inner.locks.insert(
            key.to_string(),
            InvocationLock {
                key: key.to_string(),
                owner_id,
                lock_until,
                locked_at: now,
                last_released_at,
            },
        );
        Ok(LockAcquire::Acquired {
            owner_id,
            lock_until,
        })
    }

    async fn release_lock(&self, key: &str, owner_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(lock) = inner.locks.get_mut(key) {
            if lock.owner_id == owner_id {
                lock.lock_until = now;
                lock.last_released_at = Some(now);
            }
        }
        Ok(())
    }

    async fn fixed_window_hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let mut inner = self.inner.lock().await;
        let counter = inner
            .counters
            .entry(key.to_string())
            .or_insert_with(|| RateLimitCounter {
                key: key.to_string(),
                count: 0,
                window_started_at: now,
                expires_at: now + window,
            });
        if counter.expires_at <= now {
            counter.count = 0;
            counter.window_started_at = now;
            counter.expires_at = now + window;
        }
        counter.count += 1;
        Ok(RateLimitDecision {
            allowed: counter.count <= limit,
            remaining: limit.saturating_sub(counter.count),
            retry_after_seconds: (counter.expires_at - now).num_seconds().max(1),
        })
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        lock_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<WebhookClaim> {
        let mut inner = self.inner.lock().await;
        match inner.webhook_events.get_mut(event_id) {
            None => {
                inner.webhook_events.insert(
                    event_id.to_string(),
                    ProcessedWebhookEvent {
                        event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        status: WebhookEventStatus::Processing,
                        attempts: 1,
                        lock_expires_at: now + lock_ttl,
                        processed_at: None,
                        last_error: None,
                    },
                );
                Ok(WebhookClaim::Claimed)
            }
            Some(event) => match event.status {
                WebhookEventStatus::Processed => Ok(WebhookClaim::AlreadyProcessed),
                WebhookEventStatus::Processing if event.lock_expires_at > now => {
                    Ok(WebhookClaim::InFlight)
                }
                _ => {
                    event.status = WebhookEventStatus::Processing;
                    event.attempts += 1;
                    event.lock_expires_at = now + lock_ttl;
                    Ok(WebhookClaim::Claimed)
                }
            },
        }
    }

    async fn complete_webhook_event(&self, event_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.webhook_events.get_mut(event_id) {
            event.status = WebhookEventStatus::Processed;
            event.processed_at = Some(now);
            event.last_error = None;
        }
        Ok(())
    }

    async fn fail_webhook_event(
        &self,
        event_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.webhook_events.get_mut(event_id) {
            event.status = WebhookEventStatus::Failed;
            event.lock_expires_at = now;
            event.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn record_audit(&self, event: &AuditEvent) -> Result<()> {
        self.inner.lock().await.audit_events.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_core::model::{CompanyKind, CrawlStatus};
    use std::sync::Arc;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn competitor(user_id: Uuid, domain: &str, next_crawl_at: Option<DateTime<Utc>>) -> Company {
        let created = at("2026-02-01T00:00:00Z");
        Company {
            company_id: Uuid::new_v4(),
            user_id,
            kind: CompanyKind::Competitor,
            name: domain.to_string(),
            domain: domain.to_string(),
            homepage_url: Some(format!("https://{domain}/")),
            primary_pricing_url: None,
            pricing_url_candidates: vec![],
            next_crawl_at,
            crawl_lease_until: None,
            last_crawl_at: None,
            last_crawl_status: CrawlStatus::Idle,
            last_crawl_error: None,
            latest_content_hash: None,
            latest_confidence: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[tokio::test]
    async fn lease_claim_is_at_most_once_under_concurrency() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        for i in 0..4 {
            store
                .insert_company(&competitor(user_id, &format!("c{i}.example"), None))
                .await
                .unwrap();
        }

        let now = at("2026-03-01T08:00:00Z");
        let lease_until = at("2026-03-01T08:06:00Z");
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_due_company(now, lease_until).await.unwrap()
            }));
        }
        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(company) = handle.await.unwrap() {
                claimed.push(company.company_id);
            }
        }
        claimed.sort();
        claimed.dedup();
        // 4 due companies, 16 concurrent claimers: each company leased once.
        assert_eq!(claimed.len(), 4);
    }

    #[tokio::test]
    async fn claim_order_prefers_never_crawled_then_oldest() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let mut fresh = competitor(user_id, "fresh.example", None);
        fresh.updated_at = at("2026-02-20T00:00:00Z");
        let old = competitor(user_id, "old.example", Some(at("2026-02-25T00:00:00Z")));
        let newer = competitor(user_id, "newer.example", Some(at("2026-02-28T00:00:00Z")));
        store.insert_company(&newer).await.unwrap();
        store.insert_company(&old).await.unwrap();
        store.insert_company(&fresh).await.unwrap();

        let now = at("2026-03-01T08:00:00Z");
        let lease = at("2026-03-01T08:06:00Z");
        let first = store.claim_due_company(now, lease).await.unwrap().unwrap();
        let second = store.claim_due_company(now, lease).await.unwrap().unwrap();
        let third = store.claim_due_company(now, lease).await.unwrap().unwrap();
        assert_eq!(first.domain, "fresh.example");
        assert_eq!(second.domain, "old.example");
        assert_eq!(third.domain, "newer.example");
        assert!(store.claim_due_company(now, lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leased_company_is_not_reclaimed_until_expiry() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        store
            .insert_company(&competitor(user_id, "acme.example", None))
            .await
            .unwrap();
        let now = at("2026-03-01T08:00:00Z");
        let lease = at("2026-03-01T08:06:00Z");
        assert!(store.claim_due_company(now, lease).await.unwrap().is_some());
        assert!(store.claim_due_company(now, lease).await.unwrap().is_none());
        // After the lease expires the company is claimable again.
        let later = at("2026-03-01T08:07:00Z");
        assert!(store
            .claim_due_company(later, at("2026-03-01T08:13:00Z"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn lock_is_exclusive_and_release_is_fenced() {
        let store = MemoryStore::new();
        let now = at("2026-03-01T08:00:00Z");
        let ttl = Duration::minutes(8);

        let LockAcquire::Acquired { owner_id, .. } =
            store.acquire_lock("cron:crawl", ttl, now).await.unwrap()
        else {
            panic!("first acquire must win");
        };
        let second = store
            .acquire_lock("cron:crawl", ttl, now + Duration::seconds(1))
            .await
            .unwrap();
        let LockAcquire::Held {
            retry_after_seconds,
            ..
        } = second
        else {
            panic!("second acquire must observe the held lock");
        };
        assert!(retry_after_seconds > 0);

        // A stranger's release does nothing.
        store
            .release_lock("cron:crawl", Uuid::new_v4(), now + Duration::seconds(2))
            .await
            .unwrap();
        assert!(matches!(
            store
                .acquire_lock("cron:crawl", ttl, now + Duration::seconds(3))
                .await
                .unwrap(),
            LockAcquire::Held { .. }
        ));

        // The owner's release frees it.
        store
            .release_lock("cron:crawl", owner_id, now + Duration::seconds(4))
            .await
            .unwrap();
        assert!(matches!(
            store
                .acquire_lock("cron:crawl", ttl, now + Duration::seconds(5))
                .await
                .unwrap(),
            LockAcquire::Acquired { .. }
        ));
    }

    #[tokio::test]
    async fn expired_lock_is_reacquirable_without_release() {
        let store = MemoryStore::new();
        let now = at("2026-03-01T08:00:00Z");
        let ttl = Duration::minutes(8);
        assert!(matches!(
            store.acquire_lock("cron:digest", ttl, now).await.unwrap(),
            LockAcquire::Acquired { .. }
        ));
        assert!(matches!(
            store
                .acquire_lock("cron:digest", ttl, now + Duration::minutes(9))
                .await
                .unwrap(),
            LockAcquire::Acquired { .. }
        ));
    }

    #[tokio::test]
    async fn fixed_window_counts_and_resets() {
        let store = MemoryStore::new();
        let now = at("2026-03-01T08:00:00Z");
        let window = Duration::minutes(1);
        for _ in 0..3 {
            let decision = store
                .fixed_window_hit("trial:u1", 3, window, now)
                .await
                .unwrap();
            assert!(decision.allowed);
        }
        let denied = store
            .fixed_window_hit("trial:u1", 3, window, now + Duration::seconds(30))
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_seconds > 0);

        let fresh = store
            .fixed_window_hit("trial:u1", 3, window, now + Duration::minutes(2))
            .await
            .unwrap();
        assert!(fresh.allowed);
    }

    #[tokio::test]
    async fn trial_transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        store
            .insert_user(&User {
                user_id,
                email: None,
                paid_plan_price_tag: None,
                has_paid_access: false,
                trial_status: TrialStatus::NotStarted,
                trial_started_at: None,
                trial_ends_at: None,
                last_digest_sent_at: None,
            })
            .await
            .unwrap();

        let started = at("2026-03-01T08:00:00Z");
        let ends = at("2026-03-15T08:00:00Z");
        let first = store
            .transition_trial(
                user_id,
                TrialStatus::NotStarted,
                TrialStatus::Active,
                Some(started),
                Some(ends),
            )
            .await
            .unwrap();
        assert!(first);
        // The losing racer observes the already-active trial.
        let second = store
            .transition_trial(
                user_id,
                TrialStatus::NotStarted,
                TrialStatus::Active,
                Some(at("2026-03-01T08:00:01Z")),
                Some(at("2026-03-15T08:00:01Z")),
            )
            .await
            .unwrap();
        assert!(!second);
        let user = store.get_user(user_id).await.unwrap().unwrap();
        assert_eq!(user.trial_status, TrialStatus::Active);
        assert_eq!(user.trial_started_at, Some(started));
        assert_eq!(user.trial_ends_at, Some(ends));
    }

    #[tokio::test]
    async fn webhook_ledger_is_idempotent() {
        let store = MemoryStore::new();
        let now = at("2026-03-01T08:00:00Z");
        let ttl = Duration::minutes(5);
        assert_eq!(
            store
                .claim_webhook_event("evt_1", "invoice.paid", ttl, now)
                .await
                .unwrap(),
            WebhookClaim::Claimed
        );
        assert_eq!(
            store
                .claim_webhook_event("evt_1", "invoice.paid", ttl, now + Duration::seconds(1))
                .await
                .unwrap(),
            WebhookClaim::InFlight
        );
        store.complete_webhook_event("evt_1", now).await.unwrap();
        assert_eq!(
            store
                .claim_webhook_event("evt_1", "invoice.paid", ttl, now + Duration::minutes(10))
                .await
                .unwrap(),
            WebhookClaim::AlreadyProcessed
        );
    }
}
