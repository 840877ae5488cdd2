//! End-to-end pipeline scenarios against the in-memory store and fixture
//! fetch backend.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pricewatch_core::canonical::canonicalize;
use pricewatch_core::model::{
    BillingPeriod, CaptureMethod, Company, CompanyKind, CrawlStatus, Diff, NormalizedDiff,
    PriceMention, PricingPayload, Severity, Snapshot, TrialStatus, User, VerificationState,
};
use pricewatch_core::normalize::{content_hash, normalize_html_for_hash};
use pricewatch_crawl::{
    BatchRunner, CrawlConfig, DigestJob, FixtureFetcher, RecordingEmailSender,
};
use pricewatch_storage::{MemoryStore, Store};
use uuid::Uuid;

const HOMEPAGE_HTML: &str = r#"<nav><a href="/pricing">Pricing</a><a href="/blog">Blog</a></nav>"#;
const PRICING_HTML: &str = "<html><body><h3>Starter</h3>$19 / month<h3>Pro</h3>$49 per month Free trial pricing plans</body></html>";
const PRICING_HTML_RAISED: &str = "<html><body><h3>Starter</h3>$19 / month<h3>Pro</h3>$59 per month Free trial pricing plans</body></html>";
const BLOCKED_HTML: &str = "<html><title>Attention Required! | Cloudflare</title></html>";

fn paid_user(tag: &str) -> User {
    User {
        user_id: Uuid::new_v4(),
        email: Some("owner@example.com".into()),
        paid_plan_price_tag: Some(tag.into()),
        has_paid_access: true,
        trial_status: TrialStatus::Converted,
        trial_started_at: None,
        trial_ends_at: None,
        last_digest_sent_at: None,
    }
}

fn competitor(user_id: Uuid, domain: &str) -> Company {
    let created = Utc::now() - Duration::days(1);
    Company {
        company_id: Uuid::new_v4(),
        user_id,
        kind: CompanyKind::Competitor,
        name: domain.to_string(),
        domain: domain.to_string(),
        homepage_url: Some(format!("https://{domain}")),
        primary_pricing_url: None,
        pricing_url_candidates: vec![],
        next_crawl_at: None,
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

fn runner(store: &Arc<MemoryStore>, fetcher: FixtureFetcher) -> BatchRunner {
    BatchRunner::new(
        store.clone() as Arc<dyn Store>,
        Arc::new(fetcher),
        Arc::new(CrawlConfig::default()),
    )
}

fn assert_close_to(actual: DateTime<Utc>, expected: DateTime<Utc>) {
    let skew = (actual - expected).num_seconds().abs();
    assert!(skew < 60, "expected {actual} within a minute of {expected}");
}

#[tokio::test]
async fn first_crawl_discovers_primary_and_writes_snapshot_without_diff() {
    let store = Arc::new(MemoryStore::new());
    let user = paid_user("price_pro_monthly");
    store.insert_user(&user).await.unwrap();
    let company = competitor(user.user_id, "acme.example");
    store.insert_company(&company).await.unwrap();

    let fetcher = FixtureFetcher::new()
        .with_html("https://acme.example/", HOMEPAGE_HTML)
        .with_html("https://acme.example/pricing", PRICING_HTML);
    let result = runner(&store, fetcher).run_batch(3).await.unwrap();

    assert_eq!(result.claimed, 1);
    assert_eq!(result.succeeded, 1);
    assert_eq!(result.snapshots_written, 1);
    assert_eq!(result.diffs_written, 0);
    assert_eq!(result.insights_written, 0);

    let company = store
        .get_company(company.company_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(company.last_crawl_status, CrawlStatus::Ok);
    assert_eq!(
        company.primary_pricing_url.as_deref(),
        Some("https://acme.example/pricing")
    );
    assert!(!company.pricing_url_candidates.is_empty());
    assert_eq!(company.pricing_url_candidates[0].confidence, 1.0);
    assert!(company.crawl_lease_until.is_none());
    assert!(company.latest_content_hash.is_some());
    assert_eq!(company.latest_confidence, Some(0.78));
    assert_close_to(
        company.next_crawl_at.unwrap(),
        Utc::now() + Duration::hours(24),
    );

    let snapshot = store
        .latest_snapshot(company.company_id)
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.is_verified);
    assert_eq!(snapshot.payload.price_mentions.len(), 2);
    assert_eq!(snapshot.payload.price_mentions[0].amount, 19.0);
    assert_eq!(snapshot.payload.price_mentions[1].amount, 49.0);
    assert_eq!(snapshot.payload.price_mentions[0].period, BillingPeriod::Month);
}

#[tokio::test]
async fn unchanged_content_short_circuits_at_the_hash_gate() {
    let store = Arc::new(MemoryStore::new());
    let user = paid_user("price_pro_monthly");
    store.insert_user(&user).await.unwrap();
    let company = competitor(user.user_id, "acme.example");
    let company_id = company.company_id;
    store.insert_company(&company).await.unwrap();

    let fetcher = FixtureFetcher::new()
        .with_html("https://acme.example/", HOMEPAGE_HTML)
        .with_html("https://acme.example/pricing", PRICING_HTML);
    runner(&store, fetcher).run_batch(3).await.unwrap();
    assert_eq!(store.snapshot_count().await, 1);

    // Make the company due again and crawl the same bytes.
    store.request_crawl_now(company_id, Utc::now()).await.unwrap();
    let fetcher = FixtureFetcher::new()
        .with_html("https://acme.example/", HOMEPAGE_HTML)
        .with_html("https://acme.example/pricing", PRICING_HTML);
    let result = runner(&store, fetcher).run_batch(3).await.unwrap();

    assert_eq!(result.claimed, 1);
    assert_eq!(result.unchanged, 1);
    assert_eq!(result.snapshots_written, 0);
    assert_eq!(store.snapshot_count().await, 1);

    let company = store.get_company(company_id).await.unwrap().unwrap();
    assert_eq!(company.last_crawl_status, CrawlStatus::Ok);
    assert_close_to(
        company.next_crawl_at.unwrap(),
        Utc::now() + Duration::hours(24),
    );
}

#[tokio::test]
async fn price_raise_produces_high_diff_and_gated_insight() {
    let store = Arc::new(MemoryStore::new());
    let user = paid_user("price_pro_monthly");
    store.insert_user(&user).await.unwrap();
    let mut company = competitor(user.user_id, "acme.example");
    company.primary_pricing_url = Some("https://acme.example/pricing".into());
    store.insert_company(&company).await.unwrap();

    // First crawl records the 19/49 baseline.
    let fetcher = FixtureFetcher::new().with_html("https://acme.example/pricing", PRICING_HTML);
    runner(&store, fetcher).run_batch(3).await.unwrap();

    // Second crawl sees 49 -> 59: +20.4%, severity high.
    store
        .request_crawl_now(company.company_id, Utc::now())
        .await
        .unwrap();
    let fetcher =
        FixtureFetcher::new().with_html("https://acme.example/pricing", PRICING_HTML_RAISED);
    let result = runner(&store, fetcher).run_batch(3).await.unwrap();

    assert_eq!(result.snapshots_written, 1);
    assert_eq!(result.diffs_written, 1);
    assert_eq!(result.insights_written, 1);
    assert_eq!(result.items[0].diff_severity, Some(Severity::High));

    let diffs = store.list_recent_diffs(user.user_id, 10).await.unwrap();
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].severity, Severity::High);
    assert_eq!(diffs[0].verification, VerificationState::Verified);
    let bucket = &diffs[0].normalized.buckets[0];
    assert_eq!(bucket.updated.len(), 1);
    assert_eq!(bucket.updated[0].previous, 49.0);
    assert_eq!(bucket.updated[0].current, 59.0);

    let insights = store.list_recent_insights(user.user_id, 10).await.unwrap();
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].diff_id, diffs[0].diff_id);
    assert_eq!(insights[0].model, "rules-v1");
    assert!(insights[0]
        .recommendation
        .action_items
        .iter()
        .any(|a| a.contains("within 24 hours")));
}

#[tokio::test]
async fn medium_diff_is_not_surfaced_to_a_starter_owner() {
    let store = Arc::new(MemoryStore::new());
    let user = paid_user("price_starter_monthly");
    store.insert_user(&user).await.unwrap();
    let mut company = competitor(user.user_id, "acme.example");
    company.primary_pricing_url = Some("https://acme.example/pricing".into());
    store.insert_company(&company).await.unwrap();

    let fetcher = FixtureFetcher::new().with_html("https://acme.example/pricing", PRICING_HTML);
    runner(&store, fetcher).run_batch(3).await.unwrap();

    // 49 -> 55 is ~12%: medium, below the starter high_only gate.
    store
        .request_crawl_now(company.company_id, Utc::now())
        .await
        .unwrap();
    let raised = PRICING_HTML.replace("$49", "$55");
    let fetcher = FixtureFetcher::new().with_html("https://acme.example/pricing", &raised);
    let result = runner(&store, fetcher).run_batch(3).await.unwrap();

    assert_eq!(result.diffs_written, 1);
    assert_eq!(result.items[0].diff_severity, Some(Severity::Medium));
    assert_eq!(result.insights_written, 0);
    assert!(store
        .list_recent_insights(user.user_id, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn bot_blocked_page_schedules_long_backoff_and_audits() {
    let store = Arc::new(MemoryStore::new());
    let user = paid_user("price_pro_monthly");
    store.insert_user(&user).await.unwrap();
    let mut company = competitor(user.user_id, "acme.example");
    company.primary_pricing_url = Some("https://acme.example/pricing".into());
    let company_id = company.company_id;
    store.insert_company(&company).await.unwrap();

    let fetcher = FixtureFetcher::new().with_html("https://acme.example/pricing", BLOCKED_HTML);
    let result = runner(&store, fetcher).run_batch(3).await.unwrap();

    assert_eq!(result.blocked, 1);
    assert_eq!(result.snapshots_written, 0);
    assert_eq!(store.snapshot_count().await, 0);

    let company = store.get_company(company_id).await.unwrap().unwrap();
    assert_eq!(company.last_crawl_status, CrawlStatus::Blocked);
    assert!(company.last_crawl_error.is_some());
    assert_close_to(
        company.next_crawl_at.unwrap(),
        Utc::now() + Duration::hours(36),
    );

    let events = store.audit_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, "crawl_blocked");
    assert_eq!(events[0].company_id, Some(company_id));
}

#[tokio::test]
async fn lapsed_owner_parks_the_company_as_idle() {
    let store = Arc::new(MemoryStore::new());
    let mut user = paid_user("price_pro_monthly");
    user.has_paid_access = false;
    user.trial_status = TrialStatus::Expired;
    store.insert_user(&user).await.unwrap();
    let mut company = competitor(user.user_id, "acme.example");
    company.primary_pricing_url = Some("https://acme.example/pricing".into());
    let company_id = company.company_id;
    store.insert_company(&company).await.unwrap();

    let fetcher = FixtureFetcher::new().with_html("https://acme.example/pricing", PRICING_HTML);
    let result = runner(&store, fetcher).run_batch(3).await.unwrap();

    assert_eq!(result.not_entitled, 1);
    assert_eq!(store.snapshot_count().await, 0);
    let company = store.get_company(company_id).await.unwrap().unwrap();
    assert_eq!(company.last_crawl_status, CrawlStatus::Idle);
}

#[tokio::test]
async fn company_without_any_url_needs_manual_setup() {
    let store = Arc::new(MemoryStore::new());
    let user = paid_user("price_pro_monthly");
    store.insert_user(&user).await.unwrap();
    let mut company = competitor(user.user_id, "acme.example");
    company.homepage_url = None;
    let company_id = company.company_id;
    store.insert_company(&company).await.unwrap();

    let result = runner(&store, FixtureFetcher::new()).run_batch(3).await.unwrap();
    assert_eq!(result.manual_needed, 1);
    let company = store.get_company(company_id).await.unwrap().unwrap();
    assert_eq!(company.last_crawl_status, CrawlStatus::ManualNeeded);
    assert_close_to(
        company.next_crawl_at.unwrap(),
        Utc::now() + Duration::hours(48),
    );
}

fn verified_diff(user_id: Uuid, company_id: Uuid, detected_at: DateTime<Utc>) -> Diff {
    Diff {
        diff_id: Uuid::new_v4(),
        user_id,
        company_id,
        previous_snapshot_id: Some(Uuid::new_v4()),
        current_snapshot_id: Uuid::new_v4(),
        normalized: NormalizedDiff {
            buckets: vec![],
            added_hints: vec!["contact sales".into()],
            removed_hints: vec![],
            previous_price_count: 2,
            current_price_count: 2,
            previous_plan_count: 2,
            current_plan_count: 2,
            changed_at: detected_at,
        },
        severity: Severity::Medium,
        verification: VerificationState::Verified,
        detected_at,
    }
}

#[tokio::test]
async fn digest_emails_eligible_owners_once_per_window() {
    let store = Arc::new(MemoryStore::new());
    let user = paid_user("price_pro_monthly");
    store.insert_user(&user).await.unwrap();
    let mut company = competitor(user.user_id, "acme.example");
    company.primary_pricing_url = Some("https://acme.example/pricing".into());
    store.insert_company(&company).await.unwrap();
    store
        .insert_diff(&verified_diff(
            user.user_id,
            company.company_id,
            Utc::now() - Duration::days(1),
        ))
        .await
        .unwrap();

    let email = Arc::new(RecordingEmailSender::new());
    let job = DigestJob::new(
        store.clone() as Arc<dyn Store>,
        email.clone(),
        Arc::new(CrawlConfig::default()),
    );

    let result = job.run().await.unwrap();
    assert_eq!(result.sent, 1);
    let sent = email.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "owner@example.com");
    assert!(sent[0].subject.contains("1 change"));
    assert!(sent[0].text_body.contains("[medium] acme.example"));

    // Second run inside the lookback window sends nothing.
    let result = job.run().await.unwrap();
    assert_eq!(result.sent, 0);
    assert_eq!(result.skipped_recently_sent, 1);
    assert_eq!(email.sent().await.len(), 1);
}

#[tokio::test]
async fn trial_owner_is_not_emailed() {
    let store = Arc::new(MemoryStore::new());
    let mut user = paid_user("price_pro_monthly");
    user.has_paid_access = false;
    user.paid_plan_price_tag = None;
    user.trial_status = TrialStatus::Active;
    user.trial_started_at = Some(Utc::now() - Duration::days(2));
    user.trial_ends_at = Some(Utc::now() + Duration::days(12));
    store.insert_user(&user).await.unwrap();
    let company = competitor(user.user_id, "acme.example");
    store.insert_company(&company).await.unwrap();
    store
        .insert_diff(&verified_diff(
            user.user_id,
            company.company_id,
            Utc::now() - Duration::days(1),
        ))
        .await
        .unwrap();

    let email = Arc::new(RecordingEmailSender::new());
    let job = DigestJob::new(
        store.clone() as Arc<dyn Store>,
        email.clone(),
        Arc::new(CrawlConfig::default()),
    );
    let result = job.run().await.unwrap();
    assert_eq!(result.sent, 0);
    assert_eq!(result.skipped_not_eligible, 1);
    assert!(email.sent().await.is_empty());
}

// Keep the seeded-snapshot path honest: a prior snapshot written through the
// store (not the runner) still participates in diffing.
#[tokio::test]
async fn seeded_previous_snapshot_is_diffed_against() {
    let store = Arc::new(MemoryStore::new());
    let user = paid_user("price_pro_monthly");
    store.insert_user(&user).await.unwrap();
    let mut company = competitor(user.user_id, "acme.example");
    company.primary_pricing_url = Some("https://acme.example/pricing".into());
    store.insert_company(&company).await.unwrap();

    let baseline = canonicalize(PricingPayload {
        source_url: "https://acme.example/pricing".into(),
        page_title: None,
        page_description: None,
        plan_names: vec!["starter".into(), "pro".into()],
        price_mentions: vec![
            PriceMention {
                amount: 19.0,
                currency: "USD".into(),
                period: BillingPeriod::Month,
            },
            PriceMention {
                amount: 49.0,
                currency: "USD".into(),
                period: BillingPeriod::Month,
            },
        ],
        custom_pricing_hints: vec![],
    });
    store
        .insert_snapshot(&Snapshot {
            snapshot_id: Uuid::new_v4(),
            user_id: user.user_id,
            company_id: company.company_id,
            captured_at: Utc::now() - Duration::days(1),
            capture_method: CaptureMethod::Manual,
            confidence: 0.9,
            content_hash: content_hash(&normalize_html_for_hash(PRICING_HTML)),
            payload: baseline,
            is_verified: true,
        })
        .await
        .unwrap();

    let fetcher =
        FixtureFetcher::new().with_html("https://acme.example/pricing", PRICING_HTML_RAISED);
    let result = runner(&store, fetcher).run_batch(3).await.unwrap();
    assert_eq!(result.diffs_written, 1);
    assert_eq!(result.items[0].diff_severity, Some(Severity::High));
}
