//! Monthly security report built from persisted history.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use secpulse_core::{score, DayWindow, SeverityCounts, SourceRunStatus};
use secpulse_storage::PersistenceStore;
use serde::{Deserialize, Serialize};

use crate::summary::Rollup;
use crate::trend::{build_trend, Trend, TrendMetric};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub total: u64,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyReport {
    /// `YYYY-MM`
    pub month: String,
    pub window: DayWindow,
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub rollup: Rollup,
    pub daily: Vec<DailyPoint>,
    /// Event volume against the same number of days immediately before the month.
    pub volume_trend: Trend,
    pub score_trend: Trend,
    pub sources: Vec<SourceRunStatus>,
}

pub async fn build_monthly_report(
    store: Arc<dyn PersistenceStore>,
    month: DayWindow,
) -> anyhow::Result<MonthlyReport> {
    let previous = month.preceding();
    let span = DayWindow {
        start: previous.start,
        end: month.end,
    };
    let aggregates = store
        .daily_aggregates(None, span)
        .await
        .with_context(|| format!("loading aggregates for {}", month.month_label()))?;
    let sources = store
        .source_statuses()
        .await
        .context("loading source statuses")?;

    let daily = month
        .iter_days()
        .map(|date| {
            let mut counts = SeverityCounts::default();
            for agg in aggregates.iter().filter(|a| a.date == date) {
                counts.merge(&agg.by_severity);
            }
            DailyPoint {
                date,
                total: counts.total(),
                score: score(&counts),
            }
        })
        .collect();

    Ok(MonthlyReport {
        month: month.month_label(),
        window: month,
        generated_at: Utc::now(),
        rollup: Rollup::from_aggregates(aggregates.iter().filter(|a| month.contains(a.date))),
        daily,
        volume_trend: build_trend(TrendMetric::Total, None, &aggregates, month, previous),
        score_trend: build_trend(TrendMetric::Score, None, &aggregates, month, previous),
        sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trend::Direction;
    use secpulse_core::{Category, DailyAggregate};
    use secpulse_storage::MemoryStore;
    use std::collections::BTreeMap;

    fn row(date: NaiveDate, high: u64) -> DailyAggregate {
        DailyAggregate {
            date,
            source: "edr".into(),
            category: Category::Alert,
            by_severity: SeverityCounts {
                high,
                ..SeverityCounts::default()
            },
            by_status: BTreeMap::new(),
            total: high,
        }
    }

    #[tokio::test]
    async fn report_covers_every_day_and_compares_with_prior_period() {
        let store = Arc::new(MemoryStore::new());
        let feb_last = NaiveDate::from_ymd_opt(2026, 2, 27).unwrap();
        let mar_first = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let mar_tenth = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        for agg in [row(feb_last, 2), row(mar_first, 3), row(mar_tenth, 1)] {
            store
                .replace_daily_aggregates("edr", agg.date, &[agg.clone()])
                .await
                .unwrap();
        }

        let month = DayWindow::parse_month("2026-03").unwrap();
        let report = build_monthly_report(store, month).await.unwrap();
        assert_eq!(report.month, "2026-03");
        assert_eq!(report.daily.len(), 31);
        assert_eq!(report.daily[0].total, 3);
        assert_eq!(report.daily[0].score, 100 - 15);
        assert_eq!(report.daily[1].score, 100);
        assert_eq!(report.rollup.total_events, 4);
        assert_eq!(report.volume_trend.previous, 2.0);
        assert_eq!(report.volume_trend.direction, Direction::Up);
        assert_eq!(report.volume_trend.change_percent, 100.0);
        assert!(report.sources.is_empty());
    }
}
