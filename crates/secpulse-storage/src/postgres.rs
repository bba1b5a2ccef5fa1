//! Postgres-backed [`PersistenceStore`] built on sqlx.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use secpulse_core::{
    CollectedRecord, DailyAggregate, DayWindow, RunCompletion, RunLogEntry, SeverityCounts,
    SourceRunStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::{PersistenceStore, RunLogPage, RunLogQuery, StoreError};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_column<T: std::str::FromStr>(
    table: &'static str,
    column: &str,
    value: &str,
) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|err| StoreError::Corrupt {
        table,
        detail: format!("{column}: {err}"),
    })
}

fn record_from_row(row: &PgRow) -> Result<CollectedRecord, StoreError> {
    let category: String = row.try_get("category")?;
    let severity: String = row.try_get("severity")?;
    Ok(CollectedRecord {
        id: row.try_get("record_id")?,
        source: row.try_get("source")?,
        category: parse_column("collected_records", "category", &category)?,
        severity: parse_column("collected_records", "severity", &severity)?,
        status: row.try_get("status")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        occurred_at: row.try_get("occurred_at")?,
        raw: row.try_get("raw")?,
    })
}

fn aggregate_from_row(row: &PgRow) -> Result<DailyAggregate, StoreError> {
    let category: String = row.try_get("category")?;
    let by_status: Json<BTreeMap<String, u64>> = row.try_get("by_status")?;
    Ok(DailyAggregate {
        date: row.try_get("day")?,
        source: row.try_get("source")?,
        category: parse_column("daily_aggregates", "category", &category)?,
        by_severity: SeverityCounts {
            critical: to_u64(row.try_get("critical")?),
            high: to_u64(row.try_get("high")?),
            medium: to_u64(row.try_get("medium")?),
            low: to_u64(row.try_get("low")?),
            informational: to_u64(row.try_get("informational")?),
        },
        by_status: by_status.0,
        total: to_u64(row.try_get("total")?),
    })
}

fn status_from_row(row: &PgRow) -> Result<SourceRunStatus, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(SourceRunStatus {
        source: row.try_get("source")?,
        status: parse_column("source_run_status", "status", &status)?,
        last_sync_at: row.try_get("last_sync_at")?,
        last_error: row.try_get("last_error")?,
        records_synced: to_u64(row.try_get("records_synced")?),
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_log_from_row(row: &PgRow) -> Result<RunLogEntry, StoreError> {
    let outcome: String = row.try_get("outcome")?;
    Ok(RunLogEntry {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        source: row.try_get("source")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        outcome: parse_column("run_log", "outcome", &outcome)?,
        records_synced: to_u64(row.try_get("records_synced")?),
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl PersistenceStore for PgStore {
    async fn upsert_record(
        &self,
        record: &CollectedRecord,
    ) -> Result<Option<NaiveDate>, StoreError> {
        // The CTE reads the pre-statement snapshot, so `prev` is the row as it was
        // before this upsert.
        let previous: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            WITH prev AS (
                SELECT occurred_at
                  FROM collected_records
                 WHERE source = $1 AND record_id = $2
            )
            INSERT INTO collected_records
                (source, record_id, category, severity, status, title, description, occurred_at, raw)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source, record_id) DO UPDATE
               SET category    = EXCLUDED.category,
                   severity    = EXCLUDED.severity,
                   status      = EXCLUDED.status,
                   title       = EXCLUDED.title,
                   description = EXCLUDED.description,
                   occurred_at = EXCLUDED.occurred_at,
                   raw         = EXCLUDED.raw,
                   updated_at  = NOW()
            RETURNING (SELECT occurred_at FROM prev)
            "#,
        )
        .bind(&record.source)
        .bind(&record.id)
        .bind(record.category.as_str())
        .bind(record.severity.as_str())
        .bind(&record.status)
        .bind(&record.title)
        .bind(&record.description)
        .bind(record.occurred_at)
        .bind(&record.raw)
        .fetch_one(&self.pool)
        .await?;
        Ok(previous.map(|at| at.date_naive()))
    }

    async fn get_record(
        &self,
        source: &str,
        id: &str,
    ) -> Result<Option<CollectedRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT source, record_id, category, severity, status, title, description, occurred_at, raw
              FROM collected_records
             WHERE source = $1 AND record_id = $2
            "#,
        )
        .bind(source)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn count_records(&self, source: Option<&str>) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM collected_records
             WHERE ($1::text IS NULL OR source = $1)
            "#,
        )
        .bind(source)
        .fetch_one(&self.pool)
        .await?;
        Ok(to_u64(count))
    }

    async fn records_on_dates(
        &self,
        source: &str,
        dates: &[NaiveDate],
    ) -> Result<Vec<CollectedRecord>, StoreError> {
        if dates.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT source, record_id, category, severity, status, title, description, occurred_at, raw
              FROM collected_records
             WHERE source = $1
               AND (occurred_at AT TIME ZONE 'UTC')::date = ANY($2)
             ORDER BY occurred_at, record_id
            "#,
        )
        .bind(source)
        .bind(dates.to_vec())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn replace_daily_aggregates(
        &self,
        source: &str,
        date: NaiveDate,
        aggregates: &[DailyAggregate],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM daily_aggregates WHERE source = $1 AND day = $2")
            .bind(source)
            .bind(date)
            .execute(&mut *tx)
            .await?;

        for agg in aggregates {
            if agg.source != source || agg.date != date {
                return Err(StoreError::Corrupt {
                    table: "daily_aggregates",
                    detail: format!(
                        "aggregate for {}/{} passed to replace {}/{}",
                        agg.source, agg.date, source, date
                    ),
                });
            }
            sqlx::query(
                r#"
                INSERT INTO daily_aggregates
                    (day, source, category, critical, high, medium, low, informational, total, by_status, computed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
                ON CONFLICT (day, source, category) DO UPDATE
                   SET critical      = EXCLUDED.critical,
                       high          = EXCLUDED.high,
                       medium        = EXCLUDED.medium,
                       low           = EXCLUDED.low,
                       informational = EXCLUDED.informational,
                       total         = EXCLUDED.total,
                       by_status     = EXCLUDED.by_status,
                       computed_at   = NOW()
                "#,
            )
            .bind(agg.date)
            .bind(&agg.source)
            .bind(agg.category.as_str())
            .bind(to_i64(agg.by_severity.critical))
            .bind(to_i64(agg.by_severity.high))
            .bind(to_i64(agg.by_severity.medium))
            .bind(to_i64(agg.by_severity.low))
            .bind(to_i64(agg.by_severity.informational))
            .bind(to_i64(agg.total))
            .bind(Json(&agg.by_status))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn daily_aggregates(
        &self,
        source: Option<&str>,
        window: DayWindow,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT day, source, category, critical, high, medium, low, informational, total, by_status
              FROM daily_aggregates
             WHERE day >= $1 AND day < $2
               AND ($3::text IS NULL OR source = $3)
             ORDER BY day, source, category
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .bind(source)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(aggregate_from_row).collect()
    }

    async fn upsert_source_status(&self, status: &SourceRunStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO source_run_status
                (source, status, last_sync_at, last_error, records_synced, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source) DO UPDATE
               SET status         = EXCLUDED.status,
                   last_sync_at   = COALESCE(EXCLUDED.last_sync_at, source_run_status.last_sync_at),
                   last_error     = EXCLUDED.last_error,
                   records_synced = EXCLUDED.records_synced,
                   updated_at     = EXCLUDED.updated_at
            "#,
        )
        .bind(&status.source)
        .bind(status.status.as_str())
        .bind(status.last_sync_at)
        .bind(&status.last_error)
        .bind(to_i64(status.records_synced))
        .bind(status.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn source_statuses(&self) -> Result<Vec<SourceRunStatus>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source, status, last_sync_at, last_error, records_synced, updated_at
              FROM source_run_status
             ORDER BY source
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(status_from_row).collect()
    }

    async fn insert_run_log(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO run_log
                (id, run_id, source, started_at, completed_at, outcome, records_synced, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.run_id)
        .bind(&entry.source)
        .bind(entry.started_at)
        .bind(entry.completed_at)
        .bind(entry.outcome.as_str())
        .bind(to_i64(entry.records_synced))
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_run_log(
        &self,
        id: Uuid,
        completion: &RunCompletion,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE run_log
               SET completed_at   = $2,
                   outcome        = $3,
                   records_synced = $4,
                   error_message  = $5
             WHERE id = $1
               AND completed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(completion.completed_at)
        .bind(completion.outcome.as_str())
        .bind(to_i64(completion.records_synced))
        .bind(&completion.error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn run_logs(&self, query: &RunLogQuery) -> Result<RunLogPage, StoreError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM run_log WHERE ($1::text IS NULL OR source = $1)",
        )
        .bind(query.source.as_deref())
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT id, run_id, source, started_at, completed_at, outcome, records_synced, error_message
              FROM run_log
             WHERE ($1::text IS NULL OR source = $1)
             ORDER BY started_at DESC, id
             LIMIT $2 OFFSET $3
            "#,
        )
        .bind(query.source.as_deref())
        .bind(i64::try_from(query.per_page()).unwrap_or(i64::MAX))
        .bind(i64::try_from(query.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(RunLogPage {
            entries: rows.iter().map(run_log_from_row).collect::<Result<_, _>>()?,
            page: query.page(),
            per_page: query.per_page(),
            total: to_u64(total),
        })
    }
}
