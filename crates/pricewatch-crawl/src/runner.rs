//! The batch runner: claim → resolve → fetch → hash-gate → snapshot → diff
//! → insight, with a finalizer that always runs.
//!
//! Each claimed company is processed inside its own spawned task so a panic
//! in one item still reaches Finalize and cannot poison the batch; the
//! finalizer writes the backoff schedule, clears the lease, and emits audit
//! events for terminal failures.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use pricewatch_core::canonical::canonicalize;
use pricewatch_core::diff::compute_diff;
use pricewatch_core::discovery::merge_candidates;
use pricewatch_core::entitlements::{resolve_entitlements, trial_refresh};
use pricewatch_core::insight::{build_insight, InsightDecision};
use pricewatch_core::model::{
    AuditEvent, AuditOutcome, CaptureMethod, Company, CrawlStatus, Diff, Insight, InsightFeedback,
    PricingCandidate, Severity, Snapshot, TrialStatus,
};
use pricewatch_storage::{CrawlFinalize, FetchBackend, PageArchive, Store};
use serde::Serialize;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CrawlConfig;
use crate::discovery::PricingDiscovery;
use crate::extractor::{Extraction, PricingExtractor};

const MAX_ERROR_LEN: usize = 400;

fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_LEN).collect()
}

/// What one item's processing decided; consumed by the finalizer.
#[derive(Debug, Clone)]
struct ItemOutcome {
    status: CrawlStatus,
    label: &'static str,
    error: Option<String>,
    latest_content_hash: Option<String>,
    latest_confidence: Option<f64>,
    merged_candidates: Option<Vec<PricingCandidate>>,
    discovered_primary_url: Option<String>,
    snapshot_written: bool,
    diff_severity: Option<Severity>,
    insight_written: bool,
}

impl ItemOutcome {
    fn new() -> Self {
        Self {
            status: CrawlStatus::Error,
            label: "error",
            error: None,
            latest_content_hash: None,
            latest_confidence: None,
            merged_candidates: None,
            discovered_primary_url: None,
            snapshot_written: false,
            diff_severity: None,
            insight_written: false,
        }
    }

    fn fail(mut self, status: CrawlStatus, label: &'static str, error: String) -> Self {
        self.status = status;
        self.label = label;
        self.error = Some(error);
        self
    }

    fn not_entitled(mut self) -> Self {
        self.status = CrawlStatus::Idle;
        self.label = "not_entitled";
        self.error = None;
        self
    }

    fn from_join_error(err: JoinError) -> Self {
        ItemOutcome::new().fail(
            CrawlStatus::Error,
            "error",
            format!("crawl task failed: {err}"),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub company_id: Uuid,
    pub domain: String,
    pub status: CrawlStatus,
    pub outcome: String,
    pub error: Option<String>,
    pub snapshot_written: bool,
    pub diff_severity: Option<Severity>,
    pub insight_written: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub limit: usize,
    pub claimed: usize,
    pub succeeded: usize,
    pub unchanged: usize,
    pub snapshots_written: usize,
    pub diffs_written: usize,
    pub insights_written: usize,
    pub blocked: usize,
    pub manual_needed: usize,
    pub errored: usize,
    pub not_entitled: usize,
    pub items: Vec<ItemReport>,
}

pub struct BatchRunner {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn FetchBackend>,
    config: Arc<CrawlConfig>,
}

impl BatchRunner {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn FetchBackend>,
        config: Arc<CrawlConfig>,
    ) -> Self {
        Self {
            store,
            fetcher,
            config,
        }
    }

    /// Claim and process up to `limit` due competitors.
    pub async fn run_batch(&self, limit: usize) -> Result<BatchResult> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut items: Vec<ItemReport> = Vec::new();

        while items.len() < limit {
            let now = Utc::now();
            let lease_until = now + self.config.lease;
            let Some(company) = self.store.claim_due_company(now, lease_until).await? else {
                break;
            };
            info!(run_id = %run_id, domain = %company.domain, "claimed company");

            let work = tokio::spawn(process_item(
                self.store.clone(),
                self.fetcher.clone(),
                self.config.clone(),
                company.clone(),
            ));
            let outcome = match work.await {
                Ok(outcome) => outcome,
                Err(err) => ItemOutcome::from_join_error(err),
            };
            self.finalize_item(&company, &outcome).await;
            items.push(ItemReport {
                company_id: company.company_id,
                domain: company.domain.clone(),
                status: outcome.status,
                outcome: outcome.label.to_string(),
                error: outcome.error.clone(),
                snapshot_written: outcome.snapshot_written,
                diff_severity: outcome.diff_severity,
                insight_written: outcome.insight_written,
            });
        }

        let claimed = items.len();
        Ok(BatchResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            limit,
            claimed,
            succeeded: items.iter().filter(|i| i.status == CrawlStatus::Ok).count(),
            unchanged: items.iter().filter(|i| i.outcome == "unchanged").count(),
            snapshots_written: items.iter().filter(|i| i.snapshot_written).count(),
            diffs_written: items.iter().filter(|i| i.diff_severity.is_some()).count(),
            insights_written: items.iter().filter(|i| i.insight_written).count(),
            blocked: items
                .iter()
                .filter(|i| i.status == CrawlStatus::Blocked)
                .count(),
            manual_needed: items
                .iter()
                .filter(|i| i.status == CrawlStatus::ManualNeeded)
                .count(),
            errored: items
                .iter()
                .filter(|i| i.status == CrawlStatus::Error)
                .count(),
            not_entitled: items.iter().filter(|i| i.outcome == "not_entitled").count(),
            items,
        })
    }

    /// Runs for every claimed item whatever happened: writes the terminal
    /// status and backoff, clears the lease, persists observation fields,
    /// and records the failure audit trail.
    async fn finalize_item(&self, company: &Company, outcome: &ItemOutcome) {
        let now = Utc::now();
        let update = CrawlFinalize {
            last_crawl_status: outcome.status,
            next_crawl_at: now + self.config.delay_for(outcome.status),
            last_crawl_error: outcome.error.as_deref().map(truncate_error),
            latest_content_hash: outcome.latest_content_hash.clone(),
            latest_confidence: outcome.latest_confidence,
            merged_candidates: outcome.merged_candidates.clone(),
            discovered_primary_url: outcome.discovered_primary_url.clone(),
        };
        if let Err(err) = self
            .store
            .finalize_crawl(company.company_id, now, update)
            .await
        {
            warn!(domain = %company.domain, %err, "failed to finalize crawl");
        }

        let action = match outcome.status {
            CrawlStatus::Blocked => "crawl_blocked",
            CrawlStatus::ManualNeeded => "crawl_manual_needed",
            CrawlStatus::Error => "crawl_error",
            CrawlStatus::Ok | CrawlStatus::Idle => return,
        };
        let event = AuditEvent {
            event_id: Uuid::new_v4(),
            user_id: company.user_id,
            company_id: Some(company.company_id),
            action: action.to_string(),
            outcome: AuditOutcome::Failure,
            metadata: serde_json::json!({
                "domain": company.domain,
                "error": outcome.error,
            }),
            created_at: now,
        };
        if let Err(err) = self.store.record_audit(&event).await {
            warn!(domain = %company.domain, %err, "failed to record audit event");
        }
    }
}

/// The per-item state machine, isolated in its own task.
async fn process_item(
    store: Arc<dyn Store>,
    fetcher: Arc<dyn FetchBackend>,
    config: Arc<CrawlConfig>,
    company: Company,
) -> ItemOutcome {
    let mut outcome = ItemOutcome::new();

    // Resolving: primary URL, or discovery from the homepage.
    let mut target_url = company.primary_pricing_url.clone();
    if target_url.is_none() {
        if let Some(homepage) = &company.homepage_url {
            let discovery = PricingDiscovery::new(fetcher.clone(), config.discovery);
            match discovery.discover(homepage, &company.domain).await {
                Ok(found) => {
                    outcome.merged_candidates = Some(merge_candidates(
                        &company.pricing_url_candidates,
                        &found.candidates,
                    ));
                    if let Some(primary) = found.recommended_primary_url {
                        outcome.discovered_primary_url = Some(primary.clone());
                        target_url = Some(primary);
                    }
                }
                Err(err) => {
                    return outcome.fail(
                        CrawlStatus::ManualNeeded,
                        "no_url",
                        format!("Pricing URL discovery failed: {err}"),
                    );
                }
            }
        }
    }
    let Some(url) = target_url else {
        return outcome.fail(
            CrawlStatus::ManualNeeded,
            "no_url",
            "No pricing URL configured and none discovered".to_string(),
        );
    };

    // Entitlement check on the owning user.
    let mut user = match store.get_user(company.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return outcome.not_entitled(),
        Err(err) => {
            return outcome.fail(
                CrawlStatus::Error,
                "error",
                format!("loading owner failed: {err}"),
            )
        }
    };
    let now = Utc::now();
    if let Some(next) = trial_refresh(&user, now) {
        if let Err(err) = store
            .transition_trial(user.user_id, TrialStatus::Active, next, None, None)
            .await
        {
            warn!(user_id = %user.user_id, %err, "trial refresh write failed");
        }
        user.trial_status = next;
    }
    let entitlements = resolve_entitlements(&user, &config.plan_rules, now);
    if !entitlements.has_access() {
        return outcome.not_entitled();
    }

    // Fetching.
    let archive = config.archive_dir.as_ref().map(PageArchive::new);
    let extractor = PricingExtractor::new(fetcher.clone(), archive);
    let (content_hash, payload, confidence, is_verified) = match extractor.extract(&url).await {
        Extraction::Failed { status, error } => {
            let label = match status {
                CrawlStatus::Blocked => "blocked",
                CrawlStatus::ManualNeeded => "manual_needed",
                _ => "error",
            };
            // Failed extractions observe zero confidence; the previous
            // content hash stays untouched.
            outcome.latest_confidence = Some(0.0);
            return outcome.fail(status, label, error);
        }
        Extraction::Ok {
            content_hash,
            payload,
            confidence,
            is_verified,
        } => (content_hash, payload, confidence, is_verified),
    };
    outcome.latest_content_hash = Some(content_hash.clone());
    outcome.latest_confidence = Some(confidence);

    // Hash gate: identical normalized text means no downstream work.
    if company.latest_content_hash.as_deref() == Some(content_hash.as_str()) {
        outcome.status = CrawlStatus::Ok;
        outcome.label = "unchanged";
        return outcome;
    }

    // The previous snapshot must be read before the new one lands.
    let previous = match store.latest_snapshot(company.company_id).await {
        Ok(previous) => previous,
        Err(err) => {
            return outcome.fail(
                CrawlStatus::Error,
                "error",
                format!("loading previous snapshot failed: {err}"),
            )
        }
    };

    let captured_at = Utc::now();
    let snapshot = Snapshot {
        snapshot_id: Uuid::new_v4(),
        user_id: company.user_id,
        company_id: company.company_id,
        captured_at,
        capture_method: CaptureMethod::Static,
        confidence,
        content_hash,
        payload,
        is_verified,
    };
    if let Err(err) = store.insert_snapshot(&snapshot).await {
        return outcome.fail(
            CrawlStatus::Error,
            "error",
            format!("storing snapshot failed: {err}"),
        );
    }
    outcome.snapshot_written = true;
    outcome.status = CrawlStatus::Ok;
    outcome.label = "snapshot";

    let Some(previous) = previous else {
        return outcome;
    };
    let previous_payload = canonicalize(previous.payload);
    let Some(computed) = compute_diff(
        &previous_payload,
        &snapshot.payload,
        snapshot.is_verified,
        captured_at,
    ) else {
        return outcome;
    };

    let diff = Diff {
        diff_id: Uuid::new_v4(),
        user_id: company.user_id,
        company_id: company.company_id,
        previous_snapshot_id: Some(previous.snapshot_id),
        current_snapshot_id: snapshot.snapshot_id,
        normalized: computed.normalized,
        severity: computed.severity,
        verification: computed.verification,
        detected_at: captured_at,
    };
    if let Err(err) = store.insert_diff(&diff).await {
        return outcome.fail(
            CrawlStatus::Error,
            "error",
            format!("storing diff failed: {err}"),
        );
    }
    outcome.diff_severity = Some(diff.severity);

    match build_insight(&entitlements, diff.severity, diff.verification, &diff.normalized) {
        InsightDecision::Skip(reason) => {
            debug!(domain = %company.domain, reason, "insight skipped");
        }
        InsightDecision::Create(new_insight) => {
            let insight = Insight {
                insight_id: Uuid::new_v4(),
                user_id: company.user_id,
                company_id: company.company_id,
                diff_id: diff.diff_id,
                model: new_insight.model,
                prompt_tokens: new_insight.prompt_tokens,
                completion_tokens: new_insight.completion_tokens,
                total_cost_usd: new_insight.total_cost_usd,
                recommendation: new_insight.recommendation,
                severity_gate: new_insight.severity_gate,
                generated_at: captured_at,
                feedback: InsightFeedback::None,
            };
            if let Err(err) = store.insert_insight(&insight).await {
                return outcome.fail(
                    CrawlStatus::Error,
                    "error",
                    format!("storing insight failed: {err}"),
                );
            }
            outcome.insight_written = true;
        }
    }

    outcome
}
