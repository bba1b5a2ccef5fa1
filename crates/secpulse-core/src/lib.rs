//! Core domain model for secpulse: normalized records, aggregates, run bookkeeping.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod scoring;
pub mod window;

pub use scoring::score;
pub use window::{parse_days_spec, CollectionWindow, DayWindow, WindowError};

pub const CRATE_NAME: &str = "secpulse-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Alert,
    Incident,
    Ticket,
    Host,
    Event,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Alert,
        Category::Incident,
        Category::Ticket,
        Category::Host,
        Category::Event,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Alert => "alert",
            Category::Incident => "incident",
            Category::Ticket => "ticket",
            Category::Host => "host",
            Category::Event => "event",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().trim_end_matches('s') {
            "alert" => Ok(Category::Alert),
            "incident" => Ok(Category::Incident),
            "ticket" => Ok(Category::Ticket),
            "host" => Ok(Category::Host),
            "event" => Ok(Category::Event),
            _ => Err(ParseEnumError::new("category", s)),
        }
    }
}

/// Severity levels ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Informational,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Informational,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Informational => "informational",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    /// Accepts the canonical names plus the abbreviations providers commonly emit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "crit" | "p1" => Ok(Severity::Critical),
            "high" | "p2" => Ok(Severity::High),
            "medium" | "med" | "moderate" | "p3" => Ok(Severity::Medium),
            "low" | "p4" => Ok(Severity::Low),
            "informational" | "info" | "none" | "p5" => Ok(Severity::Informational),
            _ => Err(ParseEnumError::new("severity", s)),
        }
    }
}

/// One normalized unit collected from a source. Identity is `(source, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedRecord {
    pub id: String,
    pub source: String,
    pub category: Category,
    pub severity: Severity,
    pub status: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl CollectedRecord {
    pub fn identity(&self) -> (&str, &str) {
        (&self.source, &self.id)
    }

    pub fn occurred_on(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    #[serde(default)]
    pub informational: u64,
}

impl SeverityCounts {
    pub fn add(&mut self, severity: Severity, n: u64) {
        let slot = match severity {
            Severity::Critical => &mut self.critical,
            Severity::High => &mut self.high,
            Severity::Medium => &mut self.medium,
            Severity::Low => &mut self.low,
            Severity::Informational => &mut self.informational,
        };
        *slot = slot.saturating_add(n);
    }

    pub fn get(&self, severity: Severity) -> u64 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Informational => self.informational,
        }
    }

    pub fn merge(&mut self, other: &SeverityCounts) {
        for severity in Severity::ALL {
            self.add(severity, other.get(severity));
        }
    }

    pub fn total(&self) -> u64 {
        Severity::ALL
            .iter()
            .fold(0u64, |acc, s| acc.saturating_add(self.get(*s)))
    }
}

/// Precomputed counts for one `(date, source, category)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub source: String,
    pub category: Category,
    pub by_severity: SeverityCounts,
    pub by_status: BTreeMap<String, u64>,
    pub total: u64,
}

/// Group records into daily aggregates keyed by `(date, source, category)`.
///
/// Output is sorted by that key. Callers pass every stored record for the dates
/// they want recomputed; partial input yields partial counts.
pub fn aggregate_records<'a, I>(records: I) -> Vec<DailyAggregate>
where
    I: IntoIterator<Item = &'a CollectedRecord>,
{
    let mut groups: BTreeMap<(NaiveDate, String, Category), DailyAggregate> = BTreeMap::new();
    for record in records {
        let key = (record.occurred_on(), record.source.clone(), record.category);
        let agg = groups.entry(key).or_insert_with(|| DailyAggregate {
            date: record.occurred_on(),
            source: record.source.clone(),
            category: record.category,
            by_severity: SeverityCounts::default(),
            by_status: BTreeMap::new(),
            total: 0,
        });
        agg.by_severity.add(record.severity, 1);
        *agg.by_status
            .entry(record.status.trim().to_ascii_lowercase())
            .or_default() += 1;
        agg.total += 1;
    }
    groups.into_values().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    Healthy,
    Error,
    NotConfigured,
    Unknown,
}

impl SourceHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceHealth::Healthy => "healthy",
            SourceHealth::Error => "error",
            SourceHealth::NotConfigured => "not_configured",
            SourceHealth::Unknown => "unknown",
        }
    }
}

impl FromStr for SourceHealth {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(SourceHealth::Healthy),
            "error" => Ok(SourceHealth::Error),
            "not_configured" => Ok(SourceHealth::NotConfigured),
            "unknown" => Ok(SourceHealth::Unknown),
            _ => Err(ParseEnumError::new("source status", s)),
        }
    }
}

/// Last known state of one source; overwritten at the end of every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRunStatus {
    pub source: String,
    pub status: SourceHealth,
    /// Time of the last successful sync. Failed and skipped runs leave it untouched.
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub records_synced: u64,
    pub updated_at: DateTime<Utc>,
}

impl SourceRunStatus {
    pub fn unknown(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            status: SourceHealth::Unknown,
            last_sync_at: None,
            last_error: None,
            records_synced: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Pending => "pending",
            RunOutcome::Success => "success",
            RunOutcome::Failed => "failed",
            RunOutcome::Skipped => "skipped",
        }
    }
}

impl FromStr for RunOutcome {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunOutcome::Pending),
            "success" => Ok(RunOutcome::Success),
            "failed" => Ok(RunOutcome::Failed),
            "skipped" => Ok(RunOutcome::Skipped),
            _ => Err(ParseEnumError::new("run outcome", s)),
        }
    }
}

/// Append-only audit row for one collection attempt against one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub records_synced: u64,
    pub error_message: Option<String>,
}

impl RunLogEntry {
    pub fn start(run_id: Uuid, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            source: source.into(),
            started_at: Utc::now(),
            completed_at: None,
            outcome: RunOutcome::Pending,
            records_synced: 0,
            error_message: None,
        }
    }
}

/// Terminal result of a run, as written back into the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub completed_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub records_synced: u64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failed,
    Skipped,
}

impl From<OutcomeStatus> for RunOutcome {
    fn from(status: OutcomeStatus) -> Self {
        match status {
            OutcomeStatus::Success => RunOutcome::Success,
            OutcomeStatus::Failed => RunOutcome::Failed,
            OutcomeStatus::Skipped => RunOutcome::Skipped,
        }
    }
}

/// Itemized per-source result returned by collection triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_synced: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl SourceOutcome {
    pub fn success(source: impl Into<String>, records_synced: u64, duration_ms: u64) -> Self {
        Self {
            source: source.into(),
            status: OutcomeStatus::Success,
            records_synced: Some(records_synced),
            error: None,
            duration_ms,
        }
    }

    /// `committed` is the number of records persisted before the failure, if any were attempted.
    pub fn failed(
        source: impl Into<String>,
        error: impl Into<String>,
        committed: Option<u64>,
        duration_ms: u64,
    ) -> Self {
        Self {
            source: source.into(),
            status: OutcomeStatus::Failed,
            records_synced: committed,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn skipped(source: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            source: source.into(),
            status: OutcomeStatus::Skipped,
            records_synced: None,
            error: None,
            duration_ms,
        }
    }
}
