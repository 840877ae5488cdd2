//! Idempotent schema setup for the Postgres backend.

use anyhow::{Context, Result};
use sqlx::PgPool;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        user_id UUID PRIMARY KEY,
        email TEXT,
        paid_plan_price_tag TEXT,
        has_paid_access BOOLEAN NOT NULL DEFAULT FALSE,
        trial_status TEXT NOT NULL DEFAULT 'not_started',
        trial_started_at TIMESTAMPTZ,
        trial_ends_at TIMESTAMPTZ,
        last_digest_sent_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS companies (
        company_id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        domain TEXT NOT NULL,
        homepage_url TEXT,
        primary_pricing_url TEXT,
        pricing_url_candidates JSONB NOT NULL DEFAULT '[]'::jsonb,
        next_crawl_at TIMESTAMPTZ,
        crawl_lease_until TIMESTAMPTZ,
        last_crawl_at TIMESTAMPTZ,
        last_crawl_status TEXT NOT NULL DEFAULT 'idle',
        last_crawl_error TEXT,
        latest_content_hash TEXT,
        latest_confidence DOUBLE PRECISION,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        CONSTRAINT companies_user_kind_domain_key UNIQUE (user_id, kind, domain)
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS companies_one_self_per_user
        ON companies (user_id) WHERE kind = 'self'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS companies_due_idx
        ON companies (kind, next_crawl_at, updated_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        snapshot_id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        company_id UUID NOT NULL,
        captured_at TIMESTAMPTZ NOT NULL,
        capture_method TEXT NOT NULL,
        confidence DOUBLE PRECISION NOT NULL,
        content_hash TEXT NOT NULL,
        payload JSONB NOT NULL,
        is_verified BOOLEAN NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS snapshots_company_captured_idx
        ON snapshots (company_id, captured_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS diffs (
        diff_id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        company_id UUID NOT NULL,
        previous_snapshot_id UUID,
        current_snapshot_id UUID NOT NULL,
        normalized JSONB NOT NULL,
        severity TEXT NOT NULL,
        verification TEXT NOT NULL,
        detected_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS diffs_user_detected_idx
        ON diffs (user_id, detected_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS insights (
        insight_id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        company_id UUID NOT NULL,
        diff_id UUID NOT NULL,
        model TEXT NOT NULL,
        prompt_tokens BIGINT NOT NULL DEFAULT 0,
        completion_tokens BIGINT NOT NULL DEFAULT 0,
        total_cost_usd DOUBLE PRECISION NOT NULL DEFAULT 0,
        recommendation JSONB NOT NULL,
        severity_gate TEXT NOT NULL,
        generated_at TIMESTAMPTZ NOT NULL,
        feedback TEXT NOT NULL DEFAULT 'none'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cron_run_locks (
        key TEXT PRIMARY KEY,
        owner_id UUID NOT NULL,
        lock_until TIMESTAMPTZ NOT NULL,
        locked_at TIMESTAMPTZ NOT NULL,
        last_released_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rate_limit_counters (
        key TEXT PRIMARY KEY,
        count BIGINT NOT NULL,
        window_started_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS processed_webhook_events (
        event_id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts BIGINT NOT NULL DEFAULT 0,
        lock_expires_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ,
        last_error TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_events (
        event_id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        company_id UUID,
        action TEXT NOT NULL,
        outcome TEXT NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Apply every migration statement in order.
pub async fn apply_migrations(pool: &PgPool) -> Result<()> {
    for (index, statement) in MIGRATIONS.iter().enumerate() {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("applying migration statement {index}"))?;
    }
    Ok(())
}
