//! Postgres store backend.
//!
//! Runtime-checked queries only (`sqlx::query` + `try_get`), matching the
//! rest of the stack. Concurrency-sensitive operations are single
//! statements: the lease claim is a find-and-modify with
//! `FOR UPDATE SKIP LOCKED`, the invocation lock is an upsert guarded by
//! `lock_until <= now`, and releases are fenced by owner id.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pricewatch_core::model::{
    AuditEvent, CaptureMethod, Company, CompanyKind, CrawlStatus, Diff, Insight, InsightFeedback,
    PricingCandidate, Severity, SeverityGate, Snapshot, TrialStatus, User, VerificationState,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::store::{
    CrawlFinalize, CrawlNowOutcome, InsertCompanyOutcome, LockAcquire, RateLimitDecision, Store,
    WebhookClaim,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    let trial_status: String = row.try_get("trial_status")?;
    Ok(User {
        user_id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        paid_plan_price_tag: row.try_get("paid_plan_price_tag")?,
        has_paid_access: row.try_get("has_paid_access")?,
        trial_status: TrialStatus::parse(&trial_status)
            .ok_or_else(|| anyhow!("unknown trial status {trial_status}"))?,
        trial_started_at: row.try_get("trial_started_at")?,
        trial_ends_at: row.try_get("trial_ends_at")?,
        last_digest_sent_at: row.try_get("last_digest_sent_at")?,
    })
}

fn company_from_row(row: &PgRow) -> Result<Company> {
    let kind: String = row.try_get("kind")?;
    let last_crawl_status: String = row.try_get("last_crawl_status")?;
    let candidates: serde_json::Value = row.try_get("pricing_url_candidates")?;
    Ok(Company {
        company_id: row.try_get("company_id")?,
        user_id: row.try_get("user_id")?,
        kind: CompanyKind::parse(&kind).ok_or_else(|| anyhow!("unknown company kind {kind}"))?,
        name: row.try_get("name")?,
        domain: row.try_get("domain")?,
        homepage_url: row.try_get("homepage_url")?,
        primary_pricing_url: row.try_get("primary_pricing_url")?,
        pricing_url_candidates: serde_json::from_value(candidates)
            .context("decoding pricing_url_candidates")?,
        next_crawl_at: row.try_get("next_crawl_at")?,
        crawl_lease_until: row.try_get("crawl_lease_until")?,
        last_crawl_at: row.try_get("last_crawl_at")?,
        last_crawl_status: CrawlStatus::parse(&last_crawl_status)
            .ok_or_else(|| anyhow!("unknown crawl status {last_crawl_status}"))?,
        last_crawl_error: row.try_get("last_crawl_error")?,
        latest_content_hash: row.try_get("latest_content_hash")?,
        latest_confidence: row.try_get("latest_confidence")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot> {
    let capture_method: String = row.try_get("capture_method")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    Ok(Snapshot {
        snapshot_id: row.try_get("snapshot_id")?,
        user_id: row.try_get("user_id")?,
        company_id: row.try_get("company_id")?,
        captured_at: row.try_get("captured_at")?,
        capture_method: CaptureMethod::parse(&capture_method)
            .ok_or_else(|| anyhow!("unknown capture method {capture_method}"))?,
        confidence: row.try_get("confidence")?,
        content_hash: row.try_get("content_hash")?,
        payload: serde_json::from_value(payload).context("decoding snapshot payload")?,
        is_verified: row.try_get("is_verified")?,
    })
}

fn diff_from_row(row: &PgRow) -> Result<Diff> {
    let severity: String = row.try_get("severity")?;
    let verification: String = row.try_get("verification")?;
    let normalized: serde_json::Value = row.try_get("normalized")?;
    Ok(Diff {
        diff_id: row.try_get("diff_id")?,
        user_id: row.try_get("user_id")?,
        company_id: row.try_get("company_id")?,
        previous_snapshot_id: row.try_get("previous_snapshot_id")?,
        current_snapshot_id: row.try_get("current_snapshot_id")?,
        normalized: serde_json::from_value(normalized).context("decoding normalized diff")?,
        severity: Severity::parse(&severity)
            .ok_or_else(|| anyhow!("unknown severity {severity}"))?,
        verification: VerificationState::parse(&verification)
            .ok_or_else(|| anyhow!("unknown verification state {verification}"))?,
        detected_at: row.try_get("detected_at")?,
    })
}

fn insight_from_row(row: &PgRow) -> Result<Insight> {
    let severity_gate: String = row.try_get("severity_gate")?;
    let feedback: String = row.try_get("feedback")?;
    let recommendation: serde_json::Value = row.try_get("recommendation")?;
    let prompt_tokens: i64 = row.try_get("prompt_tokens")?;
    let completion_tokens: i64 = row.try_get("completion_tokens")?;
    Ok(Insight {
        insight_id: row.try_get("insight_id")?,
        user_id: row.try_get("user_id")?,
        company_id: row.try_get("company_id")?,
        diff_id: row.try_get("diff_id")?,
        model: row.try_get("model")?,
        prompt_tokens: prompt_tokens as u32,
        completion_tokens: completion_tokens as u32,
        total_cost_usd: row.try_get("total_cost_usd")?,
        recommendation: serde_json::from_value(recommendation)
            .context("decoding recommendation")?,
        severity_gate: SeverityGate::parse(&severity_gate)
            .ok_or_else(|| anyhow!("unknown severity gate {severity_gate}"))?,
        generated_at: row.try_get("generated_at")?,
        feedback: InsightFeedback::parse(&feedback)
            .ok_or_else(|| anyhow!("unknown feedback {feedback}"))?,
    })
}

fn candidates_json(candidates: &[PricingCandidate]) -> Result<serde_json::Value> {
    serde_json::to_value(candidates).context("encoding pricing_url_candidates")
}

#[async_trait]
impl Store for PgStore {
    async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, email, paid_plan_price_tag, has_paid_access,
                               trial_status, trial_started_at, trial_ends_at, last_digest_sent_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id) DO UPDATE SET
                email = EXCLUDED.email,
                paid_plan_price_tag = EXCLUDED.paid_plan_price_tag,
                has_paid_access = EXCLUDED.has_paid_access,
                trial_status = EXCLUDED.trial_status,
                trial_started_at = EXCLUDED.trial_started_at,
                trial_ends_at = EXCLUDED.trial_ends_at,
                last_digest_sent_at = EXCLUDED.last_digest_sent_at
            "#,
        )
        .bind(user.user_id)
        .bind(&user.email)
        .bind(&user.paid_plan_price_tag)
        .bind(user.has_paid_access)
        .bind(user.trial_status.as_str())
        .bind(user.trial_started_at)
        .bind(user.trial_ends_at)
        .bind(user.last_digest_sent_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn transition_trial(
        &self,
        user_id: Uuid,
        from: TrialStatus,
        to: TrialStatus,
        started_at: Option<DateTime<Utc>>,
        ends_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
               SET trial_status = $3,
                   trial_started_at = COALESCE($4, trial_started_at),
                   trial_ends_at = COALESCE($5, trial_ends_at)
             WHERE user_id = $1 AND trial_status = $2
            "#,
        )
        .bind(user_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(started_at)
        .bind(ends_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_last_digest_sent_at(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET last_digest_sent_at = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_company(&self, company: &Company) -> Result<InsertCompanyOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO companies (company_id, user_id, kind, name, domain,
                                   homepage_url, primary_pricing_url, pricing_url_candidates,
                                   next_crawl_at, crawl_lease_until, last_crawl_at,
                                   last_crawl_status, last_crawl_error,
                                   latest_content_hash, latest_confidence,
                                   created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(company.company_id)
        .bind(company.user_id)
        .bind(company.kind.as_str())
        .bind(&company.name)
        .bind(&company.domain)
        .bind(&company.homepage_url)
        .bind(&company.primary_pricing_url)
        .bind(candidates_json(&company.pricing_url_candidates)?)
        .bind(company.next_crawl_at)
        .bind(company.crawl_lease_until)
        .bind(company.last_crawl_at)
        .bind(company.last_crawl_status.as_str())
        .bind(&company.last_crawl_error)
        .bind(&company.latest_content_hash)
        .bind(company.latest_confidence)
        .bind(company.created_at)
        .bind(company.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertCompanyOutcome::Inserted),
            Err(err) => {
                if let sqlx::Error::Database(db) = &err {
                    match db.constraint() {
                        Some("companies_one_self_per_user") => {
                            return Ok(InsertCompanyOutcome::DuplicateSelf)
                        }
                        Some("companies_user_kind_domain_key") => {
                            return Ok(InsertCompanyOutcome::DuplicateDomain)
                        }
                        _ => {}
                    }
                }
                Err(err.into())
            }
        }
    }

    async fn get_company(&self, company_id: Uuid) -> Result<Option<Company>> {
        let row = sqlx::query("SELECT * FROM companies WHERE company_id = $1")
            .bind(company_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(company_from_row).transpose()
    }

    async fn list_companies(&self, user_id: Uuid) -> Result<Vec<Company>> {
        let rows = sqlx::query("SELECT * FROM companies WHERE user_id = $1 ORDER BY created_at")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(company_from_row).collect()
    }

    async fn count_competitors(&self, user_id: Uuid) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM companies WHERE user_id = $1 AND kind = 'competitor'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u32)
    }

    async fn claim_due_company(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Company>> {
        let row = sqlx::query(
            r#"
            UPDATE companies
               SET crawl_lease_until = $2, updated_at = $1
             WHERE company_id = (
                   SELECT company_id FROM companies
                    WHERE kind = 'competitor'
                      AND (next_crawl_at IS NULL OR next_crawl_at <= $1)
                      AND (crawl_lease_until IS NULL OR crawl_lease_until <= $1)
                    ORDER BY next_crawl_at ASC NULLS FIRST, updated_at ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED)
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(company_from_row).transpose()
    }

    async fn finalize_crawl(
        &self,
        company_id: Uuid,
        now: DateTime<Utc>,
        update: CrawlFinalize,
    ) -> Result<()> {
        let candidates = update
            .merged_candidates
            .as_deref()
            .map(candidates_json)
            .transpose()?;
        sqlx::query(
            r#"
            UPDATE companies
               SET last_crawl_at = $2,
                   last_crawl_status = $3,
                   next_crawl_at = $4,
                   crawl_lease_until = NULL,
                   last_crawl_error = $5,
                   latest_content_hash = COALESCE($6, latest_content_hash),
                   latest_confidence = COALESCE($7, latest_confidence),
                   pricing_url_candidates = COALESCE($8, pricing_url_candidates),
                   primary_pricing_url = COALESCE(primary_pricing_url, $9),
                   updated_at = $2
             WHERE company_id = $1
            "#,
        )
        .bind(company_id)
        .bind(now)
        .bind(update.last_crawl_status.as_str())
        .bind(update.next_crawl_at)
        .bind(&update.last_crawl_error)
        .bind(&update.latest_content_hash)
        .bind(update.latest_confidence)
        .bind(candidates)
        .bind(&update.discovered_primary_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_candidates(
        &self,
        company_id: Uuid,
        candidates: Vec<PricingCandidate>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE companies SET pricing_url_candidates = $2, updated_at = $3 WHERE company_id = $1",
        )
        .bind(company_id)
        .bind(candidates_json(&candidates)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_primary_pricing(
        &self,
        company_id: Uuid,
        url: String,
        candidates: Vec<PricingCandidate>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE companies
               SET primary_pricing_url = $2, pricing_url_candidates = $3, updated_at = $4
             WHERE company_id = $1
            "#,
        )
        .bind(company_id)
        .bind(url)
        .bind(candidates_json(&candidates)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_crawl_now(
        &self,
        company_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CrawlNowOutcome> {
        let row = sqlx::query(
            r#"
            UPDATE companies
               SET next_crawl_at = $2,
                   crawl_lease_until = CASE
                       WHEN crawl_lease_until IS NULL OR crawl_lease_until <= $2 THEN NULL
                       ELSE crawl_lease_until
                   END,
                   updated_at = $2
             WHERE company_id = $1
            RETURNING crawl_lease_until
            "#,
        )
        .bind(company_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("unknown company {company_id}"))?;
        let lease_until: Option<DateTime<Utc>> = row.try_get("crawl_lease_until")?;
        match lease_until {
            Some(until) if until > now => Ok(CrawlNowOutcome::LeaseActive { lease_until: until }),
            _ => Ok(CrawlNowOutcome::Scheduled),
        }
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (snapshot_id, user_id, company_id, captured_at,
                                   capture_method, confidence, content_hash, payload, is_verified)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(snapshot.snapshot_id)
        .bind(snapshot.user_id)
        .bind(snapshot.company_id)
        .bind(snapshot.captured_at)
        .bind(snapshot.capture_method.as_str())
        .bind(snapshot.confidence)
        .bind(&snapshot.content_hash)
        .bind(serde_json::to_value(&snapshot.payload).context("encoding snapshot payload")?)
        .bind(snapshot.is_verified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_snapshot(&self, company_id: Uuid) -> Result<Option<Snapshot>> {
        let row = sqlx::query(
            "SELECT * FROM snapshots WHERE company_id = $1 ORDER BY captured_at DESC LIMIT 1",
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn insert_diff(&self, diff: &Diff) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO diffs (diff_id, user_id, company_id, previous_snapshot_id,
                               current_snapshot_id, normalized, severity, verification, detected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(diff.diff_id)
        .bind(diff.user_id)
        .bind(diff.company_id)
        .bind(diff.previous_snapshot_id)
        .bind(diff.current_snapshot_id)
        .bind(serde_json::to_value(&diff.normalized).context("encoding normalized diff")?)
        .bind(diff.severity.as_str())
        .bind(diff.verification.as_str())
        .bind(diff.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_verified_diffs_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Diff>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM diffs
             WHERE user_id = $1 AND verification = 'verified' AND detected_at >= $2
             ORDER BY detected_at DESC
             LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(diff_from_row).collect()
    }

    async fn list_recent_diffs(&self, user_id: Uuid, limit: usize) -> Result<Vec<Diff>> {
        let rows = sqlx::query(
            "SELECT * FROM diffs WHERE user_id = $1 ORDER BY detected_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(diff_from_row).collect()
    }

    async fn insert_insight(&self, insight: &Insight) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO insights (insight_id, user_id, company_id, diff_id, model,
                                  prompt_tokens, completion_tokens, total_cost_usd,
                                  recommendation, severity_gate, generated_at, feedback)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(insight.insight_id)
        .bind(insight.user_id)
        .bind(insight.company_id)
        .bind(insight.diff_id)
        .bind(&insight.model)
        .bind(insight.prompt_tokens as i64)
        .bind(insight.completion_tokens as i64)
        .bind(insight.total_cost_usd)
        .bind(serde_json::to_value(&insight.recommendation).context("encoding recommendation")?)
        .bind(insight.severity_gate.as_str())
        .bind(insight.generated_at)
        .bind(insight.feedback.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_recent_insights(&self, user_id: Uuid, limit: usize) -> Result<Vec<Insight>> {
        let rows = sqlx::query(
            "SELECT * FROM insights WHERE user_id = $1 ORDER BY generated_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(insight_from_row).collect()
    }

    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LockAcquire> {
        let owner_id = Uuid::new_v4();
        let lock_until = now + ttl;
        let row = sqlx::query(
            r#"
            INSERT INTO cron_run_locks (key, owner_id, lock_until, locked_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE SET
                owner_id = EXCLUDED.owner_id,
                lock_until = EXCLUDED.lock_until,
                locked_at = EXCLUDED.locked_at
             WHERE cron_run_locks.lock_until <= $4
            RETURNING lock_until
            "#,
        )
        .bind(key)
        .bind(owner_id)
        .bind(lock_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_some() {
            return Ok(LockAcquire::Acquired {
                owner_id,
                lock_until,
            });
        }

        let held = sqlx::query("SELECT lock_until FROM cron_run_locks WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let held_until: DateTime<Utc> = match held {
            Some(row) => row.try_get("lock_until")?,
            None => now,
        };
        Ok(LockAcquire::Held {
            lock_until: held_until,
            retry_after_seconds: (held_until - now).num_seconds().max(1),
        })
    }

    async fn release_lock(&self, key: &str, owner_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cron_run_locks
               SET lock_until = $3, last_released_at = $3
             WHERE key = $1 AND owner_id = $2
            "#,
        )
        .bind(key)
        .bind(owner_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fixed_window_hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let row = sqlx::query(
            r#"
            INSERT INTO rate_limit_counters (key, count, window_started_at, expires_at)
            VALUES ($1, 1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET
                count = CASE WHEN rate_limit_counters.expires_at <= $2
                             THEN 1 ELSE rate_limit_counters.count + 1 END,
                window_started_at = CASE WHEN rate_limit_counters.expires_at <= $2
                                         THEN $2 ELSE rate_limit_counters.window_started_at END,
                expires_at = CASE WHEN rate_limit_counters.expires_at <= $2
                                  THEN $3 ELSE rate_limit_counters.expires_at END
            RETURNING count, expires_at
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(now + window)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("count")?;
        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
        let count = count.max(0) as u32;
        Ok(RateLimitDecision {
            allowed: count <= limit,
            remaining: limit.saturating_sub(count),
            retry_after_seconds: (expires_at - now).num_seconds().max(1),
        })
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        lock_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<WebhookClaim> {
        let row = sqlx::query(
            r#"
            INSERT INTO processed_webhook_events (event_id, event_type, status, attempts, lock_expires_at)
            VALUES ($1, $2, 'processing', 1, $3)
            ON CONFLICT (event_id) DO UPDATE SET
                status = 'processing',
                attempts = processed_webhook_events.attempts + 1,
                lock_expires_at = $3
             WHERE processed_webhook_events.status = 'failed'
                OR (processed_webhook_events.status = 'processing'
                    AND processed_webhook_events.lock_expires_at <= $4)
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(now + lock_ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        if row.is_some() {
            return Ok(WebhookClaim::Claimed);
        }
        let status_row =
            sqlx::query("SELECT status FROM processed_webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        match status_row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                if status == "processed" {
                    Ok(WebhookClaim::AlreadyProcessed)
                } else {
                    Ok(WebhookClaim::InFlight)
                }
            }
            None => Ok(WebhookClaim::InFlight),
        }
    }

    async fn complete_webhook_event(&self, event_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processed_webhook_events
               SET status = 'processed', processed_at = $2, last_error = NULL
             WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_webhook_event(
        &self,
        event_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processed_webhook_events
               SET status = 'failed', lock_expires_at = $2, last_error = $3
             WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(now)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_audit(&self, event: &AuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (event_id, user_id, company_id, action, outcome, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.event_id)
        .bind(event.user_id)
        .bind(event.company_id)
        .bind(&event.action)
        .bind(event.outcome.as_str())
        .bind(event.metadata.clone())
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
