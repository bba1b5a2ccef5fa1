//! Durable persistence + best-effort cache for secpulse.

use async_trait::async_trait;
use chrono::NaiveDate;
use secpulse_core::{
    CollectedRecord, DailyAggregate, DayWindow, RunCompletion, RunLogEntry, SourceRunStatus,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod cache;
pub mod memory;
pub mod postgres;

pub use cache::{
    CacheEntry, CacheError, CacheKey, CacheLayer, CachedValue, DisabledCache, MemoryCache,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "secpulse-storage";

pub const DEFAULT_PER_PAGE: usize = 50;
pub const MAX_PER_PAGE: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt {table} row: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Paginated, optionally source-filtered run-log read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogQuery {
    pub source: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

impl RunLogQuery {
    pub fn page(&self) -> usize {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> usize {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE)
    }

    /// Saturates, so an absurd page number reads past the end instead of overflowing.
    pub fn offset(&self) -> usize {
        (self.page() - 1).saturating_mul(self.per_page())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogPage {
    pub entries: Vec<RunLogEntry>,
    pub page: usize,
    pub per_page: usize,
    pub total: u64,
}

/// Durable store for records, aggregates, source status and the run log.
///
/// Every write is keyed by natural identity and safe to repeat. Implementations
/// must apply each record upsert atomically; batches are not transactional.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Insert or overwrite one record. Returns the previously stored occurrence
    /// date when the row already existed, so callers can recompute that day too.
    async fn upsert_record(
        &self,
        record: &CollectedRecord,
    ) -> Result<Option<NaiveDate>, StoreError>;

    async fn get_record(
        &self,
        source: &str,
        id: &str,
    ) -> Result<Option<CollectedRecord>, StoreError>;

    async fn count_records(&self, source: Option<&str>) -> Result<u64, StoreError>;

    /// All stored records of `source` whose UTC occurrence date is in `dates`.
    async fn records_on_dates(
        &self,
        source: &str,
        dates: &[NaiveDate],
    ) -> Result<Vec<CollectedRecord>, StoreError>;

    /// Replace every aggregate row of `(source, date)` with `aggregates`.
    async fn replace_daily_aggregates(
        &self,
        source: &str,
        date: NaiveDate,
        aggregates: &[DailyAggregate],
    ) -> Result<(), StoreError>;

    async fn daily_aggregates(
        &self,
        source: Option<&str>,
        window: DayWindow,
    ) -> Result<Vec<DailyAggregate>, StoreError>;

    /// Overwrite the status row. A `None` `last_sync_at` keeps the stored value.
    async fn upsert_source_status(&self, status: &SourceRunStatus) -> Result<(), StoreError>;

    async fn source_statuses(&self) -> Result<Vec<SourceRunStatus>, StoreError>;

    async fn insert_run_log(&self, entry: &RunLogEntry) -> Result<(), StoreError>;

    /// Finalize a pending entry. Returns `false` if the entry is unknown or already completed.
    async fn complete_run_log(
        &self,
        id: Uuid,
        completion: &RunCompletion,
    ) -> Result<bool, StoreError>;

    /// Newest first.
    async fn run_logs(&self, query: &RunLogQuery) -> Result<RunLogPage, StoreError>;
}
