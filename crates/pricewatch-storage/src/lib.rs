//! Persistence and transport for pricewatch: the `Store` contract with its
//! in-memory and Postgres backends, the bounded HTTP fetcher behind the
//! `FetchBackend` seam, and the raw-page archive.

pub mod archive;
pub mod http;
pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod store;

pub const CRATE_NAME: &str = "pricewatch-storage";

pub use archive::{ArchivedPage, PageArchive};
pub use http::{truncate_chars, FetchBackend, FetchError, FetchedPage, HttpClientConfig, HttpFetcher};
pub use memory::MemoryStore;
pub use migrations::apply_migrations;
pub use postgres::PgStore;
pub use store::{
    CrawlFinalize, CrawlNowOutcome, InsertCompanyOutcome, LockAcquire, RateLimitDecision, Store,
    WebhookClaim,
};
