//! Period-over-period comparisons computed from persisted daily aggregates.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveDate;
use secpulse_core::{score, Category, DailyAggregate, DayWindow, Severity, SeverityCounts};
use secpulse_storage::{PersistenceStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrendError {
    #[error(
        "previous window {previous_start}..{previous_end} must end where \
         {current_start}..{current_end} starts and have the same length"
    )]
    InvalidWindows {
        current_start: NaiveDate,
        current_end: NaiveDate,
        previous_start: NaiveDate,
        previous_end: NaiveDate,
    },
    #[error("unknown trend metric {0:?}")]
    UnknownMetric(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a trend measures. Everything except `Score` is a sum over the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrendMetric {
    Total,
    Severity(Severity),
    Category(Category),
    /// Mean of the daily composite scores; days without data score full marks.
    Score,
}

impl fmt::Display for TrendMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendMetric::Total => f.write_str("total"),
            TrendMetric::Severity(s) => write!(f, "severity:{s}"),
            TrendMetric::Category(c) => write!(f, "category:{c}"),
            TrendMetric::Score => f.write_str("score"),
        }
    }
}

impl FromStr for TrendMetric {
    type Err = TrendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || TrendError::UnknownMetric(s.to_string());
        let trimmed = s.trim().to_ascii_lowercase();
        match trimmed.split_once(':') {
            None => match trimmed.as_str() {
                "total" => Ok(TrendMetric::Total),
                "score" => Ok(TrendMetric::Score),
                _ => Err(unknown()),
            },
            Some(("severity", level)) => level
                .parse()
                .map(TrendMetric::Severity)
                .map_err(|_| unknown()),
            Some(("category", kind)) => kind
                .parse()
                .map(TrendMetric::Category)
                .map_err(|_| unknown()),
            Some(_) => Err(unknown()),
        }
    }
}

impl Serialize for TrendMetric {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TrendMetric {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Flat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub metric: TrendMetric,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub current_window: DayWindow,
    pub previous_window: DayWindow,
    pub current: f64,
    pub previous: f64,
    pub change_percent: f64,
    pub direction: Direction,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// `(change_percent, direction)` for a pair of values. A zero baseline reports 0%.
pub fn compare(current: f64, previous: f64) -> (f64, Direction) {
    let change_percent = if previous == 0.0 {
        0.0
    } else {
        round1((current - previous) / previous * 100.0)
    };
    let direction = if current > previous {
        Direction::Up
    } else if current < previous {
        Direction::Down
    } else {
        Direction::Flat
    };
    (change_percent, direction)
}

/// Evaluate `metric` over the rows that fall inside `window`.
pub fn metric_value(metric: TrendMetric, aggregates: &[DailyAggregate], window: DayWindow) -> f64 {
    let rows = aggregates.iter().filter(|a| window.contains(a.date));
    match metric {
        TrendMetric::Total => rows.map(|a| a.total).sum::<u64>() as f64,
        TrendMetric::Severity(level) => rows.map(|a| a.by_severity.get(level)).sum::<u64>() as f64,
        TrendMetric::Category(kind) => rows
            .filter(|a| a.category == kind)
            .map(|a| a.total)
            .sum::<u64>() as f64,
        TrendMetric::Score => {
            let days = window.days().max(1) as f64;
            let total: u64 = window
                .iter_days()
                .map(|day| {
                    let mut counts = SeverityCounts::default();
                    aggregates
                        .iter()
                        .filter(|a| a.date == day)
                        .for_each(|a| counts.merge(&a.by_severity));
                    u64::from(score(&counts))
                })
                .sum();
            round1(total as f64 / days)
        }
    }
}

#[derive(Clone)]
pub struct TrendEngine {
    store: Arc<dyn PersistenceStore>,
}

impl TrendEngine {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self { store }
    }

    pub async fn get_trend(
        &self,
        metric: TrendMetric,
        source: Option<&str>,
        current: DayWindow,
        previous: DayWindow,
    ) -> Result<Trend, TrendError> {
        if current.days() != previous.days() || !current.is_adjacent_successor_of(&previous) {
            return Err(TrendError::InvalidWindows {
                current_start: current.start,
                current_end: current.end,
                previous_start: previous.start,
                previous_end: previous.end,
            });
        }

        let span = DayWindow {
            start: previous.start,
            end: current.end,
        };
        let aggregates = self.store.daily_aggregates(source, span).await?;
        Ok(build_trend(metric, source, &aggregates, current, previous))
    }

    /// The `days` most recent days against the `days` before them.
    pub async fn trailing(
        &self,
        metric: TrendMetric,
        source: Option<&str>,
        days: u32,
        today: NaiveDate,
    ) -> Result<Trend, TrendError> {
        let current = DayWindow::trailing(days, today);
        self.get_trend(metric, source, current, current.preceding()).await
    }
}

/// Build a trend from rows already loaded for both windows.
pub fn build_trend(
    metric: TrendMetric,
    source: Option<&str>,
    aggregates: &[DailyAggregate],
    current: DayWindow,
    previous: DayWindow,
) -> Trend {
    let current_value = metric_value(metric, aggregates, current);
    let previous_value = metric_value(metric, aggregates, previous);
    let (change_percent, direction) = compare(current_value, previous_value);
    Trend {
        metric,
        source: source.map(str::to_string),
        current_window: current,
        previous_window: previous,
        current: current_value,
        previous: previous_value,
        change_percent,
        direction,
    }
}
