//! Point-in-time security summary and the service that serves it through the cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use secpulse_adapters::AdapterRegistry;
use secpulse_core::{
    aggregate_records, score, CollectionWindow, DailyAggregate, DayWindow, SeverityCounts,
};
use secpulse_storage::{CacheKey, PersistenceStore};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::orchestrator::normalize_batch;
use crate::read_through::{ReadError, ReadThrough, Served};
use crate::report::{build_monthly_report, MonthlyReport};
use crate::trend::{Trend, TrendEngine, TrendMetric};

/// Closed months do not change once collected, so they can be cached for a day.
const CLOSED_MONTH_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceBreakdown {
    pub total: u64,
    pub by_severity: SeverityCounts,
    pub score: u32,
}

/// Totals rolled up from a set of daily aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub total_events: u64,
    pub by_severity: SeverityCounts,
    pub by_category: BTreeMap<String, u64>,
    pub by_source: BTreeMap<String, SourceBreakdown>,
    pub score: u32,
}

impl Rollup {
    pub fn from_aggregates<'a, I>(aggregates: I) -> Self
    where
        I: IntoIterator<Item = &'a DailyAggregate>,
    {
        let mut rollup = Rollup::default();
        for agg in aggregates {
            rollup.total_events = rollup.total_events.saturating_add(agg.total);
            rollup.by_severity.merge(&agg.by_severity);
            *rollup
                .by_category
                .entry(agg.category.as_str().to_string())
                .or_default() += agg.total;
            let source = rollup.by_source.entry(agg.source.clone()).or_default();
            source.total = source.total.saturating_add(agg.total);
            source.by_severity.merge(&agg.by_severity);
        }
        for source in rollup.by_source.values_mut() {
            source.score = score(&source.by_severity);
        }
        rollup.score = score(&rollup.by_severity);
        rollup
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecuritySummary {
    pub days: u32,
    pub window: DayWindow,
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub rollup: Rollup,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend: Option<Trend>,
}

impl SecuritySummary {
    pub fn from_aggregates(days: u32, window: DayWindow, aggregates: &[DailyAggregate]) -> Self {
        Self {
            days,
            window,
            generated_at: Utc::now(),
            rollup: Rollup::from_aggregates(aggregates.iter().filter(|a| window.contains(a.date))),
            trend: None,
        }
    }
}

#[derive(Clone)]
pub struct SummaryService {
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn PersistenceStore>,
    reads: ReadThrough,
    trends: TrendEngine,
    ttl_secs: u64,
    source_timeout: Duration,
}

impl SummaryService {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn PersistenceStore>,
        reads: ReadThrough,
        ttl_secs: u64,
        source_timeout: Duration,
    ) -> Self {
        Self {
            trends: TrendEngine::new(store.clone()),
            registry,
            store,
            reads,
            ttl_secs,
            source_timeout,
        }
    }

    pub fn trends(&self) -> &TrendEngine {
        &self.trends
    }

    /// Summary of the trailing `days` days, cached under `summary:{days}d`.
    ///
    /// Cache misses query every configured provider live; if that fails the
    /// summary is rebuilt from persisted aggregates and labelled degraded.
    pub async fn summary(&self, days: u32) -> Result<Served<SecuritySummary>, ReadError> {
        let today = Utc::now().date_naive();
        let window = DayWindow::trailing(days, today);
        let key = CacheKey::new("summary", format!("{days}d")).to_string();

        let compute = live_summary(
            self.registry.clone(),
            self.trends.clone(),
            self.source_timeout,
            days,
            today,
        );
        let fallback = persisted_summary(self.store.clone(), self.trends.clone(), days, today);
        self.reads
            .get_or_compute(&key, self.ttl_secs, compute, fallback)
            .await
    }

    /// Structured report for one calendar month, cached under `report:YYYY-MM`.
    pub async fn monthly_report(
        &self,
        month: DayWindow,
    ) -> Result<Served<MonthlyReport>, ReadError> {
        let key = CacheKey::new("report", month.month_label()).to_string();
        let ttl = if month.end <= Utc::now().date_naive() {
            CLOSED_MONTH_TTL_SECS
        } else {
            self.ttl_secs
        };
        let compute = build_monthly_report(self.store.clone(), month);
        let fallback = async { Err(anyhow!("no history beyond the persistence store")) };
        self.reads.get_or_compute(&key, ttl, compute, fallback).await
    }
}

async fn summary_trend(trends: &TrendEngine, days: u32, today: NaiveDate) -> Option<Trend> {
    match trends.trailing(TrendMetric::Total, None, days, today).await {
        Ok(trend) => Some(trend),
        Err(err) => {
            warn!(error = %err, "summary trend unavailable");
            None
        }
    }
}

async fn live_summary(
    registry: Arc<AdapterRegistry>,
    trends: TrendEngine,
    source_timeout: Duration,
    days: u32,
    today: NaiveDate,
) -> anyhow::Result<SecuritySummary> {
    let window = DayWindow::trailing(days, today);
    let fetch_window = CollectionWindow {
        since: window.to_collection_window().since,
        until: Utc::now(),
    };
    let configured: Vec<_> = registry.iter().filter(|a| a.is_configured()).cloned().collect();
    if configured.is_empty() {
        bail!("no configured sources to query");
    }

    let fetches = configured.into_iter().map(|adapter| async move {
        let result = tokio::time::timeout(source_timeout, adapter.fetch_batch(&fetch_window)).await;
        (adapter.source().to_string(), result)
    });
    let mut records = Vec::new();
    for (source, result) in join_all(fetches).await {
        match result {
            Ok(Ok(batch)) => records.extend(normalize_batch(&source, batch)),
            Ok(Err(err)) => return Err(anyhow!(err)).with_context(|| format!("querying {source}")),
            Err(_) => bail!("querying {source}: timed out after {}s", source_timeout.as_secs()),
        }
    }

    let aggregates = aggregate_records(&records);
    let mut summary = SecuritySummary::from_aggregates(days, window, &aggregates);
    summary.trend = summary_trend(&trends, days, today).await;
    Ok(summary)
}

async fn persisted_summary(
    store: Arc<dyn PersistenceStore>,
    trends: TrendEngine,
    days: u32,
    today: NaiveDate,
) -> anyhow::Result<SecuritySummary> {
    let window = DayWindow::trailing(days, today);
    let aggregates = store
        .daily_aggregates(None, window)
        .await
        .context("loading persisted aggregates")?;
    let mut summary = SecuritySummary::from_aggregates(days, window, &aggregates);
    summary.trend = summary_trend(&trends, days, today).await;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secpulse_core::Category;

    fn agg(day: u32, source: &str, category: Category, critical: u64, low: u64) -> DailyAggregate {
        DailyAggregate {
            date: NaiveDate::from_ymd_opt(2026, 9, day).unwrap(),
            source: source.into(),
            category,
            by_severity: SeverityCounts {
                critical,
                low,
                ..SeverityCounts::default()
            },
            by_status: BTreeMap::new(),
            total: critical + low,
        }
    }

    #[test]
    fn rollup_scores_overall_and_per_source() {
        let rows = vec![
            agg(1, "edr", Category::Alert, 2, 0),
            agg(2, "edr", Category::Alert, 0, 1),
            agg(2, "mail", Category::Event, 0, 4),
        ];
        let rollup = Rollup::from_aggregates(&rows);
        assert_eq!(rollup.total_events, 7);
        assert_eq!(rollup.score, 100 - (20 + 5));
        assert_eq!(rollup.by_source["edr"].score, 79);
        assert_eq!(rollup.by_source["mail"].score, 96);
        assert_eq!(rollup.by_category["event"], 4);
    }

    #[test]
    fn summary_ignores_rows_outside_its_window() {
        let window = DayWindow::new(
            NaiveDate::from_ymd_opt(2026, 9, 2).unwrap(),
            NaiveDate::from_ymd_opt(2026, 9, 3).unwrap(),
        )
        .unwrap();
        let rows = vec![agg(1, "edr", Category::Alert, 9, 0), agg(2, "edr", Category::Alert, 0, 1)];
        let summary = SecuritySummary::from_aggregates(1, window, &rows);
        assert_eq!(summary.rollup.total_events, 1);
        assert_eq!(summary.rollup.score, 99);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["score"], 99);
        assert!(json.get("trend").is_none());
    }
}
