use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use pricewatch_crawl::{
    BatchRunner, CrawlConfig, DigestJob, NoopEmailSender, CRAWL_LOCK_KEY, DIGEST_LOCK_KEY,
};
use pricewatch_storage::{
    apply_migrations, FetchBackend, HttpClientConfig, HttpFetcher, LockAcquire, MemoryStore,
    PgStore, Store,
};
use pricewatch_web::AppState;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Competitor pricing intelligence service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server (default).
    Serve,
    /// Claim and crawl one batch of due competitors, then exit.
    Crawl {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run the weekly digest job once, then exit.
    Digest,
    /// Apply database migrations, then exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(CrawlConfig::from_env());

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let state = build_state(config).await?;
            let _scheduler = maybe_start_scheduler(&state).await?;
            let bind =
                std::env::var("PRICEWATCH_BIND").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
            pricewatch_web::serve(state, &bind).await?;
        }
        Commands::Crawl { limit } => {
            let state = build_state(config).await?;
            run_crawl_batch(&state, limit).await?;
        }
        Commands::Digest => {
            let state = build_state(config).await?;
            run_digest(&state).await?;
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set for migrate"))?;
            let store = PgStore::connect(&url).await?;
            apply_migrations(store.pool()).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn build_state(config: Arc<CrawlConfig>) -> Result<AppState> {
    let store = build_store().await?;
    let fetcher: Arc<dyn FetchBackend> = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: config.fetch_timeout,
        user_agent: config.user_agent.clone(),
        max_body_chars: config.max_html_length,
        ..HttpClientConfig::default()
    })?);
    Ok(AppState {
        store,
        fetcher,
        email: Arc::new(NoopEmailSender),
        config,
    })
}

async fn build_store() -> Result<Arc<dyn Store>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.is_empty() => {
            let store = PgStore::connect(&url).await?;
            apply_migrations(store.pool()).await?;
            Ok(Arc::new(store))
        }
        _ => {
            warn!("DATABASE_URL is not set; falling back to the in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn run_crawl_batch(state: &AppState, limit: Option<usize>) -> Result<()> {
    let acquire = state
        .store
        .acquire_lock(CRAWL_LOCK_KEY, state.config.crawl_lock_ttl, Utc::now())
        .await?;
    let owner_id = match acquire {
        LockAcquire::Held {
            retry_after_seconds,
            ..
        } => {
            println!("crawl lock is active; retry in {retry_after_seconds}s");
            return Ok(());
        }
        LockAcquire::Acquired { owner_id, .. } => owner_id,
    };

    let limit = state.config.effective_limit(limit);
    let runner = BatchRunner::new(
        state.store.clone(),
        state.fetcher.clone(),
        state.config.clone(),
    );
    let outcome = tokio::spawn(async move { runner.run_batch(limit).await }).await;
    if let Err(err) = state
        .store
        .release_lock(CRAWL_LOCK_KEY, owner_id, Utc::now())
        .await
    {
        warn!(%err, "failed to release crawl lock");
    }
    let result = outcome??;
    println!(
        "crawl complete: claimed={} ok={} unchanged={} snapshots={} diffs={} insights={} blocked={} manual={} errors={}",
        result.claimed,
        result.succeeded,
        result.unchanged,
        result.snapshots_written,
        result.diffs_written,
        result.insights_written,
        result.blocked,
        result.manual_needed,
        result.errored,
    );
    Ok(())
}

async fn run_digest(state: &AppState) -> Result<()> {
    let acquire = state
        .store
        .acquire_lock(DIGEST_LOCK_KEY, state.config.digest_lock_ttl, Utc::now())
        .await?;
    let owner_id = match acquire {
        LockAcquire::Held {
            retry_after_seconds,
            ..
        } => {
            println!("digest lock is active; retry in {retry_after_seconds}s");
            return Ok(());
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
    let result = outcome??;
    println!(
        "digest complete: considered={} sent={} skipped_no_email={} skipped_not_eligible={}",
        result.considered, result.sent, result.skipped_no_email, result.skipped_not_eligible,
    );
    Ok(())
}

/// Optional in-process scheduler for self-hosted deployments. Off by
/// default: the canonical trigger is an external timer hitting the cron
/// endpoints.
async fn maybe_start_scheduler(state: &AppState) -> Result<Option<JobScheduler>> {
    let enabled = std::env::var("PRICEWATCH_SCHEDULER_ENABLED")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if !enabled {
        return Ok(None);
    }

    let crawl_cron =
        std::env::var("CRAWL_CRON").unwrap_or_else(|_| "0 */10 * * * *".to_string());
    let digest_cron =
        std::env::var("DIGEST_CRON").unwrap_or_else(|_| "0 0 9 * * Mon".to_string());
    let scheduler = JobScheduler::new().await?;

    let crawl_state = state.clone();
    let crawl_job = Job::new_async(crawl_cron.as_str(), move |_uuid, _lock| {
        let state = crawl_state.clone();
        Box::pin(async move {
            if let Err(err) = run_crawl_batch(&state, None).await {
                warn!(%err, "scheduled crawl batch failed");
            }
        })
    })?;
    scheduler.add(crawl_job).await?;

    let digest_state = state.clone();
    let digest_job = Job::new_async(digest_cron.as_str(), move |_uuid, _lock| {
        let state = digest_state.clone();
        Box::pin(async move {
            if let Err(err) = run_digest(&state).await {
                warn!(%err, "scheduled digest failed");
            }
        })
    })?;
    scheduler.add(digest_job).await?;

    scheduler.start().await?;
    info!(%crawl_cron, %digest_cron, "in-process scheduler started");
    Ok(Some(scheduler))
}
