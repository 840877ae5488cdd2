//! The crawl pipeline: configuration, the fetch-side pricing extractor,
//! homepage discovery, the lease-driven batch runner, and the weekly digest
//! job.

pub mod config;
pub mod digest;
pub mod discovery;
pub mod extractor;
pub mod fixture;
pub mod runner;

pub const CRATE_NAME: &str = "pricewatch-crawl";

pub use config::{CrawlConfig, CRAWL_LOCK_KEY, DIGEST_LOCK_KEY, MAX_CRAWL_BATCH_LIMIT};
pub use digest::{
    DigestJob, DigestResult, EmailMessage, EmailSender, NoopEmailSender, RecordingEmailSender,
};
pub use discovery::PricingDiscovery;
pub use extractor::{Extraction, PricingExtractor};
pub use fixture::FixtureFetcher;
pub use runner::{BatchResult, BatchRunner, ItemReport};
