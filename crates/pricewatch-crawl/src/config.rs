//! Environment-driven configuration for the crawl core.
//!
//! Every knob has a default; `CRON_SECRET` is the one input that must be set
//! for the cron entrypoints to accept any caller.

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration;
use pricewatch_core::entitlements::PlanRules;
use pricewatch_core::model::CrawlStatus;
use pricewatch_core::DiscoveryConfig;
use tracing::warn;

/// Named invocation lock for the crawl batch.
pub const CRAWL_LOCK_KEY: &str = "cron:crawl";
/// Named invocation lock for the weekly digest.
pub const DIGEST_LOCK_KEY: &str = "cron:digest";

/// Hard ceiling on `?limit=`, whatever the environment says.
pub const MAX_CRAWL_BATCH_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub cron_secret: Option<String>,
    pub batch_limit: usize,
    pub lease: Duration,
    pub success_delay: Duration,
    pub error_backoff: Duration,
    pub blocked_backoff: Duration,
    pub manual_backoff: Duration,
    pub fetch_timeout: StdDuration,
    pub max_html_length: usize,
    pub crawl_lock_ttl: Duration,
    pub digest_lock_ttl: Duration,
    pub digest_lookback: Duration,
    pub digest_max_diffs: usize,
    pub trial_duration: Duration,
    pub user_agent: String,
    pub discovery: DiscoveryConfig,
    pub plan_rules: PlanRules,
    pub archive_dir: Option<PathBuf>,
}

fn env_ms(name: &str, default_ms: i64) -> Duration {
    Duration::milliseconds(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_ms),
    )
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn load_plan_rules() -> PlanRules {
    let Some(path) = std::env::var("PLAN_RULES_PATH").ok().filter(|p| !p.is_empty()) else {
        return PlanRules::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => match serde_yaml::from_str(&text) {
            Ok(rules) => rules,
            Err(err) => {
                warn!(%path, %err, "failed to parse plan rules file, using defaults");
                PlanRules::default()
            }
        },
        Err(err) => {
            warn!(%path, %err, "failed to read plan rules file, using defaults");
            PlanRules::default()
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            cron_secret: None,
            batch_limit: 3,
            lease: Duration::milliseconds(360_000),
            success_delay: Duration::milliseconds(86_400_000),
            error_backoff: Duration::milliseconds(21_600_000),
            blocked_backoff: Duration::milliseconds(129_600_000),
            manual_backoff: Duration::milliseconds(172_800_000),
            fetch_timeout: StdDuration::from_millis(15_000),
            max_html_length: 1_000_000,
            crawl_lock_ttl: Duration::milliseconds(480_000),
            digest_lock_ttl: Duration::milliseconds(2_700_000),
            digest_lookback: Duration::days(7),
            digest_max_diffs: 30,
            trial_duration: Duration::days(14),
            user_agent: "pricewatch-bot/0.1 (+https://pricewatch.dev/bot)".to_string(),
            discovery: DiscoveryConfig::default(),
            plan_rules: PlanRules::default(),
            archive_dir: None,
        }
    }
}

impl CrawlConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cron_secret: std::env::var("CRON_SECRET").ok().filter(|s| !s.is_empty()),
            batch_limit: env_usize("CRAWL_BATCH_LIMIT", defaults.batch_limit)
                .clamp(1, MAX_CRAWL_BATCH_LIMIT),
            lease: env_ms("CRAWL_LEASE_MS", 360_000),
            success_delay: env_ms("CRAWL_SUCCESS_DELAY_MS", 86_400_000),
            error_backoff: env_ms("CRAWL_ERROR_BACKOFF_MS", 21_600_000),
            blocked_backoff: env_ms("CRAWL_BLOCKED_BACKOFF_MS", 129_600_000),
            manual_backoff: env_ms("CRAWL_MANUAL_BACKOFF_MS", 172_800_000),
            fetch_timeout: StdDuration::from_millis(
                env_i64("CRAWL_FETCH_TIMEOUT_MS", 15_000).max(1) as u64,
            ),
            max_html_length: env_usize("CRAWL_MAX_HTML_LENGTH", 1_000_000),
            crawl_lock_ttl: env_ms("CRAWL_LOCK_TTL_MS", 480_000),
            digest_lock_ttl: env_ms("DIGEST_LOCK_TTL_MS", 2_700_000),
            digest_lookback: Duration::days(env_i64("DIGEST_LOOKBACK_DAYS", 7)),
            digest_max_diffs: env_usize("DIGEST_MAX_DIFFS", 30),
            trial_duration: Duration::days(env_i64("TRIAL_DURATION_DAYS", 14)),
            user_agent: std::env::var("PRICEWATCH_USER_AGENT")
                .unwrap_or(defaults.user_agent),
            discovery: DiscoveryConfig {
                primary_threshold: env_f64("DISCOVERY_PRIMARY_THRESHOLD", 0.86),
                primary_gap: env_f64("DISCOVERY_PRIMARY_GAP", 0.08),
                ..DiscoveryConfig::default()
            },
            plan_rules: load_plan_rules(),
            archive_dir: std::env::var("ARCHIVE_DIR")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        }
    }

    /// The backoff table: how long until a company is due again after a
    /// crawl with the given terminal status.
    pub fn delay_for(&self, status: CrawlStatus) -> Duration {
        match status {
            CrawlStatus::Ok | CrawlStatus::Idle => self.success_delay,
            CrawlStatus::Error => self.error_backoff,
            CrawlStatus::Blocked => self.blocked_backoff,
            CrawlStatus::ManualNeeded => self.manual_backoff,
        }
    }

    /// Clamp a caller-supplied batch limit, falling back to the configured
    /// default when absent or zero.
    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(limit) if limit > 0 => limit.min(MAX_CRAWL_BATCH_LIMIT),
            _ => self.batch_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_falls_back_and_clamps() {
        let config = CrawlConfig::default();
        assert_eq!(config.effective_limit(None), 3);
        assert_eq!(config.effective_limit(Some(0)), 3);
        assert_eq!(config.effective_limit(Some(5)), 5);
        assert_eq!(config.effective_limit(Some(500)), MAX_CRAWL_BATCH_LIMIT);
    }

    #[test]
    fn backoff_table_matches_status() {
        let config = CrawlConfig::default();
        assert_eq!(config.delay_for(CrawlStatus::Ok), Duration::hours(24));
        assert_eq!(config.delay_for(CrawlStatus::Error), Duration::hours(6));
        assert_eq!(config.delay_for(CrawlStatus::Blocked), Duration::hours(36));
        assert_eq!(
            config.delay_for(CrawlStatus::ManualNeeded),
            Duration::hours(48)
        );
    }
}
