//! Axum HTTP surface: cron entrypoints, entitlements/trial, company
//! management, and read-only dashboard projections.
//!
//! Session handling is an external collaborator; authenticated routes trust
//! the `x-user-id` header injected by the fronting auth layer. The cron
//! entrypoints authenticate with the shared secret instead.

pub mod error;

use std::sync::Arc;

use anyhow::anyhow;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use pricewatch_core::entitlements::resolve_entitlements;
use pricewatch_core::model::{
    AuditEvent, AuditOutcome, Company, CompanyKind, CrawlStatus, PricingCandidate, TrialStatus,
    User,
};
use pricewatch_core::{
    matches_domain, merge_candidates, normalize_domain, normalize_url, trial_refresh,
};
use pricewatch_crawl::{
    BatchRunner, CrawlConfig, DigestJob, EmailSender, PricingDiscovery, CRAWL_LOCK_KEY,
    DIGEST_LOCK_KEY,
};
use pricewatch_storage::{
    CrawlNowOutcome, FetchBackend, InsertCompanyOutcome, LockAcquire, Store,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

pub use error::ApiError;

pub const CRATE_NAME: &str = "pricewatch-web";

/// Writes per user+route per minute before the fixed-window limiter kicks in.
const WRITE_RATE_LIMIT: u32 = 10;
const FEED_WINDOW_DAYS: i64 = 30;
const FEED_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub fetcher: Arc<dyn FetchBackend>,
    pub email: Arc<dyn EmailSender>,
    pub config: Arc<CrawlConfig>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/cron/crawl", get(cron_crawl).post(cron_crawl))
        .route("/cron/digest", get(cron_digest).post(cron_digest))
        .route("/entitlements/me", get(entitlements_me))
        .route("/trial/start", post(trial_start))
        .route("/companies", post(create_company))
        .route("/companies/{id}/discover-pricing", post(discover_pricing))
        .route("/companies/{id}/primary-pricing", patch(primary_pricing))
        .route("/companies/{id}/crawl-now", post(crawl_now))
        .route("/companies/{id}/retry-crawl", post(crawl_now))
        .route("/dashboard/overview", get(dashboard_overview))
        .route("/dashboard/feed", get(dashboard_feed))
        .route("/dashboard/comparison", get(dashboard_comparison))
        .with_state(state)
}

pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "pricewatch listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// -- auth -------------------------------------------------------------------

fn check_cron_auth(config: &CrawlConfig, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(secret) = config.cron_secret.as_deref() else {
        warn!("CRON_SECRET is not configured; rejecting cron invocation");
        return Err(ApiError::Unauthorized);
    };
    let header_secret = headers
        .get("x-cron-secret")
        .and_then(|value| value.to_str().ok());
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if header_secret == Some(secret) || bearer == Some(secret) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or(ApiError::Unauthorized)?;
    state
        .store
        .get_user(user_id)
        .await?
        .ok_or(ApiError::Unauthorized)
}

/// Persist any pending trial transition before resolving entitlements.
async fn refreshed_user(state: &AppState, mut user: User) -> Result<User, ApiError> {
    if let Some(next) = trial_refresh(&user, Utc::now()) {
        state
            .store
            .transition_trial(user.user_id, TrialStatus::Active, next, None, None)
            .await?;
        user.trial_status = next;
    }
    Ok(user)
}

async fn enforce_rate_limit(state: &AppState, key: String) -> Result<(), ApiError> {
    let decision = state
        .store
        .fixed_window_hit(&key, WRITE_RATE_LIMIT, Duration::minutes(1), Utc::now())
        .await?;
    if decision.allowed {
        Ok(())
    } else {
        Err(ApiError::RateLimited {
            retry_after_seconds: decision.retry_after_seconds,
        })
    }
}

async fn record_audit(
    state: &AppState,
    user_id: Uuid,
    company_id: Option<Uuid>,
    action: &str,
    outcome: AuditOutcome,
    metadata: serde_json::Value,
) {
    let event = AuditEvent {
        event_id: Uuid::new_v4(),
        user_id,
        company_id,
        action: action.to_string(),
        outcome,
        metadata,
        created_at: Utc::now(),
    };
    if let Err(err) = state.store.record_audit(&event).await {
        warn!(action, %err, "failed to record audit event");
    }
}

async fn owned_company(
    state: &AppState,
    user: &User,
    company_id: Uuid,
) -> Result<Company, ApiError> {
    state
        .store
        .get_company(company_id)
        .await?
        .filter(|company| company.user_id == user.user_id)
        .ok_or(ApiError::NotFound)
}

// -- cron entrypoints -------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct CronQuery {
    limit: Option<usize>,
}

async fn cron_crawl(
    State(state): State<AppState>,
    Query(query): Query<CronQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_cron_auth(&state.config, &headers)?;
    let acquire = state
        .store
        .acquire_lock(CRAWL_LOCK_KEY, state.config.crawl_lock_ttl, Utc::now())
        .await?;
    let owner_id = match acquire {
        LockAcquire::Held {
            lock_until,
            retry_after_seconds,
        } => {
            return Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "skipped": true,
                    "reason": "lock_active",
                    "retry_after_seconds": retry_after_seconds,
                    "lock_until": lock_until,
                })),
            )
                .into_response());
        }
        LockAcquire::Acquired { owner_id, .. } => owner_id,
    };

    let limit = state.config.effective_limit(query.limit);
    let runner = BatchRunner::new(
        state.store.clone(),
        state.fetcher.clone(),
        state.config.clone(),
    );
    // The batch runs in its own task so the lock release below happens even
    // if the runner panics.
    let outcome = tokio::spawn(async move { runner.run_batch(limit).await }).await;
    if let Err(err) = state
        .store
        .release_lock(CRAWL_LOCK_KEY, owner_id, Utc::now())
        .await
    {
        warn!(%err, "failed to release crawl lock");
    }
    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(ApiError::Internal(err)),
        Err(join_err) => {
            return Err(ApiError::Internal(anyhow!(
                "crawl batch task failed: {join_err}"
            )))
        }
    };
    Ok(Json(json!({ "ok": true, "skipped": false, "result": result })).into_response())
}

async fn cron_digest(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_cron_auth(&state.config, &headers)?;
    let acquire = state
        .store
        .acquire_lock(DIGEST_LOCK_KEY, state.config.digest_lock_ttl, Utc::now())
        .await?;
    let owner_id = match acquire {
        LockAcquire::Held {
            lock_until,
            retry_after_seconds,
        } => {
            return Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "skipped": true,
                    "reason": "lock_active",
                    "retry_after_seconds": retry_after_seconds,
                    "lock_until": lock_until,
                })),
            )
                .into_response());
        }
        LockAcquire::Acquired { owner_id, .. } => owner_id,
    };

    let job = DigestJob::new(
        state.store.clone(),
        state.email.clone(),
        state.config.clone(),
    );
    let outcome = tokio::spawn(async move { job.run().await }).await;
    if let Err(err) = state
        .store
        .release_lock(DIGEST_LOCK_KEY, owner_id, Utc::now())
        .await
    {
        warn!(%err, "failed to release digest lock");
    }
    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(ApiError::Internal(err)),
        Err(join_err) => {
            return Err(ApiError::Internal(anyhow!(
                "digest task failed: {join_err}"
            )))
        }
    };
    Ok(Json(json!({ "ok": true, "skipped": false, "result": result })).into_response())
}

// -- entitlements & trial ---------------------------------------------------

fn trial_view(user: &User) -> serde_json::Value {
    let now = Utc::now();
    let is_active = user.trial_status == TrialStatus::Active
        && user.trial_ends_at.map(|ends| ends > now).unwrap_or(false);
    json!({
        "status": user.trial_status,
        "started_at": user.trial_started_at,
        "ends_at": user.trial_ends_at,
        "is_active": is_active,
    })
}

async fn entitlements_me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = require_user(&state, &headers).await?;
    let user = refreshed_user(&state, user).await?;
    let entitlements = resolve_entitlements(&user, &state.config.plan_rules, Utc::now());
    Ok(Json(json!({
        "entitlements": entitlements,
        "trial": trial_view(&user),
    }))
    .into_response())
}

async fn trial_start(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = require_user(&state, &headers).await?;
    enforce_rate_limit(&state, format!("trial_start:{}", user.user_id)).await?;
    let user = refreshed_user(&state, user).await?;

    if user.has_paid_access {
        record_audit(
            &state,
            user.user_id,
            None,
            "trial_start",
            AuditOutcome::Rejected,
            json!({ "reason": "paid_user" }),
        )
        .await;
        return Err(ApiError::conflict("paid_user", "account already has paid access"));
    }
    match user.trial_status {
        TrialStatus::Active => {
            return Err(ApiError::conflict("already_active", "trial is already active"))
        }
        TrialStatus::Expired => {
            return Err(ApiError::conflict("already_expired", "trial has already expired"))
        }
        TrialStatus::Converted => {
            return Err(ApiError::conflict(
                "already_converted",
                "trial was already converted to a paid plan",
            ))
        }
        TrialStatus::NotStarted => {}
    }

    let now = Utc::now();
    let transitioned = state
        .store
        .transition_trial(
            user.user_id,
            TrialStatus::NotStarted,
            TrialStatus::Active,
            Some(now),
            Some(now + state.config.trial_duration),
        )
        .await?;
    if !transitioned {
        // Lost a concurrent start; the winner's dates stand.
        record_audit(
            &state,
            user.user_id,
            None,
            "trial_start",
            AuditOutcome::Rejected,
            json!({ "reason": "already_active" }),
        )
        .await;
        return Err(ApiError::conflict("already_active", "trial is already active"));
    }

    record_audit(
        &state,
        user.user_id,
        None,
        "trial_start",
        AuditOutcome::Success,
        json!({}),
    )
    .await;
    let user = state
        .store
        .get_user(user.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let entitlements = resolve_entitlements(&user, &state.config.plan_rules, now);
    Ok(Json(json!({
        "trial": trial_view(&user),
        "entitlements": entitlements,
    }))
    .into_response())
}

// -- company management -----------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateCompanyBody {
    name: String,
    #[serde(rename = "type")]
    kind: CompanyKind,
    domain: Option<String>,
    homepage_url: Option<String>,
    primary_pricing_url: Option<String>,
}

async fn create_company(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateCompanyBody>,
) -> Result<Response, ApiError> {
    let user = require_user(&state, &headers).await?;
    enforce_rate_limit(&state, format!("companies:{}", user.user_id)).await?;
    let user = refreshed_user(&state, user).await?;

    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadInput("name must not be empty".into()));
    }
    if body.domain.is_none() && body.homepage_url.is_none() && body.primary_pricing_url.is_none() {
        return Err(ApiError::BadInput(
            "one of domain, homepage_url or primary_pricing_url is required".into(),
        ));
    }

    let homepage_url = body
        .homepage_url
        .as_deref()
        .map(|raw| normalize_url(raw).ok_or_else(|| ApiError::BadInput(format!("invalid homepage_url: {raw}"))))
        .transpose()?;
    let primary_pricing_url = body
        .primary_pricing_url
        .as_deref()
        .map(|raw| {
            normalize_url(raw)
                .ok_or_else(|| ApiError::BadInput(format!("invalid primary_pricing_url: {raw}")))
        })
        .transpose()?;
    let domain = body
        .domain
        .as_deref()
        .or(homepage_url.as_deref())
        .or(primary_pricing_url.as_deref())
        .and_then(normalize_domain)
        .ok_or_else(|| ApiError::BadInput("could not derive a valid domain".into()))?;

    if let Some(url) = &primary_pricing_url {
        if !matches_domain(url, &domain) {
            return Err(ApiError::BadInput(format!(
                "primary_pricing_url must be on {domain}"
            )));
        }
    }
    if let Some(url) = &homepage_url {
        if !matches_domain(url, &domain) {
            return Err(ApiError::BadInput(format!("homepage_url must be on {domain}")));
        }
    }

    let now = Utc::now();
    if body.kind == CompanyKind::Competitor {
        let entitlements = resolve_entitlements(&user, &state.config.plan_rules, now);
        if !entitlements.has_access() {
            return Err(ApiError::forbidden(
                "no_access",
                "an active trial or paid plan is required",
            ));
        }
        let competitor_count = state.store.count_competitors(user.user_id).await?;
        if competitor_count >= entitlements.competitor_limit {
            record_audit(
                &state,
                user.user_id,
                None,
                "competitor_cap_hit",
                AuditOutcome::Rejected,
                json!({ "limit": entitlements.competitor_limit }),
            )
            .await;
            return Err(ApiError::forbidden(
                "competitor_cap",
                format!(
                    "competitor limit of {} reached for your plan",
                    entitlements.competitor_limit
                ),
            ));
        }
    }

    let company = Company {
        company_id: Uuid::new_v4(),
        user_id: user.user_id,
        kind: body.kind,
        name,
        domain,
        homepage_url,
        primary_pricing_url,
        pricing_url_candidates: vec![],
        next_crawl_at: (body.kind == CompanyKind::Competitor).then_some(now),
        crawl_lease_until: None,
        last_crawl_at: None,
        last_crawl_status: CrawlStatus::Idle,
        last_crawl_error: None,
        latest_content_hash: None,
        latest_confidence: None,
        created_at: now,
        updated_at: now,
    };
    match state.store.insert_company(&company).await? {
        InsertCompanyOutcome::Inserted => {}
        InsertCompanyOutcome::DuplicateSelf => {
            return Err(ApiError::conflict(
                "duplicate_self",
                "a company of type self already exists",
            ))
        }
        InsertCompanyOutcome::DuplicateDomain => {
            return Err(ApiError::conflict(
                "duplicate_domain",
                format!("{} is already tracked", company.domain),
            ))
        }
    }
    record_audit(
        &state,
        user.user_id,
        Some(company.company_id),
        "company_created",
        AuditOutcome::Success,
        json!({ "domain": company.domain, "type": company.kind }),
    )
    .await;
    Ok((StatusCode::CREATED, Json(json!({ "company": company }))).into_response())
}

async fn discover_pricing(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = require_user(&state, &headers).await?;
    let company = owned_company(&state, &user, company_id).await?;
    let homepage = company
        .homepage_url
        .clone()
        .ok_or_else(|| ApiError::BadInput("company has no homepage_url to discover from".into()))?;

    let discovery = PricingDiscovery::new(state.fetcher.clone(), state.config.discovery);
    let outcome = discovery
        .discover(&homepage, &company.domain)
        .await
        .map_err(ApiError::Internal)?;
    let merged = merge_candidates(&company.pricing_url_candidates, &outcome.candidates);
    state
        .store
        .update_candidates(company_id, merged.clone(), Utc::now())
        .await?;
    Ok(Json(json!({
        "candidates": merged,
        "recommended_primary_url": outcome.recommended_primary_url,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct PrimaryPricingBody {
    url: Option<String>,
    candidate_url: Option<String>,
}

async fn primary_pricing(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<PrimaryPricingBody>,
) -> Result<Response, ApiError> {
    let user = require_user(&state, &headers).await?;
    enforce_rate_limit(&state, format!("primary_pricing:{}", user.user_id)).await?;
    let company = owned_company(&state, &user, company_id).await?;

    let (chosen, confidence) = match (&body.url, &body.candidate_url) {
        (Some(raw), None) => {
            let url = normalize_url(raw)
                .ok_or_else(|| ApiError::BadInput(format!("invalid url: {raw}")))?;
            (url, 1.0)
        }
        (None, Some(raw)) => {
            let url = normalize_url(raw)
                .ok_or_else(|| ApiError::BadInput(format!("invalid candidate_url: {raw}")))?;
            let known = company
                .pricing_url_candidates
                .iter()
                .any(|candidate| candidate.url == url);
            if !known {
                return Err(ApiError::BadInput(
                    "candidate_url is not among the discovered candidates".into(),
                ));
            }
            (url, 0.0)
        }
        _ => {
            return Err(ApiError::BadInput(
                "provide exactly one of url or candidate_url".into(),
            ))
        }
    };
    if !matches_domain(&chosen, &company.domain) {
        return Err(ApiError::BadInput(format!(
            "pricing URL must be on {}",
            company.domain
        )));
    }

    let merged = merge_candidates(
        &company.pricing_url_candidates,
        &[PricingCandidate {
            url: chosen.clone(),
            confidence,
            selected_by_user: true,
        }],
    );
    state
        .store
        .set_primary_pricing(company_id, chosen, merged, Utc::now())
        .await?;
    record_audit(
        &state,
        user.user_id,
        Some(company_id),
        "primary_pricing_updated",
        AuditOutcome::Success,
        json!({}),
    )
    .await;
    let company = state
        .store
        .get_company(company_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "company": company })).into_response())
}

async fn crawl_now(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = require_user(&state, &headers).await?;
    enforce_rate_limit(&state, format!("crawl_now:{}", user.user_id)).await?;
    let company = owned_company(&state, &user, company_id).await?;

    match state.store.request_crawl_now(company_id, Utc::now()).await? {
        CrawlNowOutcome::Scheduled => {
            record_audit(
                &state,
                user.user_id,
                Some(company_id),
                "crawl_requested",
                AuditOutcome::Success,
                json!({ "domain": company.domain }),
            )
            .await;
            Ok(Json(json!({ "scheduled": true })).into_response())
        }
        CrawlNowOutcome::LeaseActive { lease_until } => {
            record_audit(
                &state,
                user.user_id,
                Some(company_id),
                "crawl_requested",
                AuditOutcome::Rejected,
                json!({ "reason": "lease_active" }),
            )
            .await;
            Err(ApiError::conflict(
                "lease_active",
                format!("a crawl is already in flight until {lease_until}"),
            ))
        }
    }
}

// -- dashboard projections --------------------------------------------------

async fn dashboard_overview(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = require_user(&state, &headers).await?;
    let companies = state.store.list_companies(user.user_id).await?;
    let competitors = companies
        .iter()
        .filter(|c| c.kind == CompanyKind::Competitor)
        .count();
    let verified_recent = state
        .store
        .list_verified_diffs_since(
            user.user_id,
            Utc::now() - Duration::days(FEED_WINDOW_DAYS),
            FEED_LIMIT,
        )
        .await?;
    let rows: Vec<serde_json::Value> = companies
        .iter()
        .map(|company| {
            json!({
                "company_id": company.company_id,
                "name": company.name,
                "domain": company.domain,
                "type": company.kind,
                "primary_pricing_url": company.primary_pricing_url,
                "last_crawl_at": company.last_crawl_at,
                "last_crawl_status": company.last_crawl_status,
                "next_crawl_at": company.next_crawl_at,
                "latest_confidence": company.latest_confidence,
            })
        })
        .collect();
    Ok(Json(json!({
        "companies": rows,
        "competitor_count": competitors,
        "recent_verified_diffs": verified_recent.len(),
    }))
    .into_response())
}

async fn dashboard_feed(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = require_user(&state, &headers).await?;
    // Only verified diffs propagate into the feed.
    let diffs = state
        .store
        .list_verified_diffs_since(
            user.user_id,
            Utc::now() - Duration::days(FEED_WINDOW_DAYS),
            FEED_LIMIT,
        )
        .await?;
    let insights = state
        .store
        .list_recent_insights(user.user_id, FEED_LIMIT)
        .await?;
    Ok(Json(json!({ "diffs": diffs, "insights": insights })).into_response())
}

async fn dashboard_comparison(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = require_user(&state, &headers).await?;
    let companies = state.store.list_companies(user.user_id).await?;
    let mut rows = Vec::with_capacity(companies.len());
    for company in companies {
        let snapshot = state.store.latest_snapshot(company.company_id).await?;
        rows.push(json!({
            "company_id": company.company_id,
            "name": company.name,
            "domain": company.domain,
            "type": company.kind,
            "snapshot": snapshot.map(|s| json!({
                "captured_at": s.captured_at,
                "confidence": s.confidence,
                "is_verified": s.is_verified,
                "payload": s.payload,
            })),
        }));
    }
    Ok(Json(json!({ "companies": rows })).into_response())
}
