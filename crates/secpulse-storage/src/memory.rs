//! In-process store used when no database is configured, and by tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use secpulse_core::{
    Category, CollectedRecord, DailyAggregate, DayWindow, RunCompletion, RunLogEntry,
    SourceRunStatus,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{PersistenceStore, RunLogPage, RunLogQuery, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<(String, String), CollectedRecord>,
    aggregates: BTreeMap<(NaiveDate, String, Category), DailyAggregate>,
    statuses: BTreeMap<String, SourceRunStatus>,
    run_log: Vec<RunLogEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn upsert_record(
        &self,
        record: &CollectedRecord,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let mut state = self.state.write().await;
        let previous = state
            .records
            .insert((record.source.clone(), record.id.clone()), record.clone());
        Ok(previous.map(|p| p.occurred_on()))
    }

    async fn get_record(
        &self,
        source: &str,
        id: &str,
    ) -> Result<Option<CollectedRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .records
            .get(&(source.to_string(), id.to_string()))
            .cloned())
    }

    async fn count_records(&self, source: Option<&str>) -> Result<u64, StoreError> {
        let state = self.state.read().await;
        let count = state
            .records
            .values()
            .filter(|r| source.map_or(true, |s| r.source == s))
            .count();
        Ok(count as u64)
    }

    async fn records_on_dates(
        &self,
        source: &str,
        dates: &[NaiveDate],
    ) -> Result<Vec<CollectedRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.source == source && dates.contains(&r.occurred_on()))
            .cloned()
            .collect())
    }

    async fn replace_daily_aggregates(
        &self,
        source: &str,
        date: NaiveDate,
        aggregates: &[DailyAggregate],
    ) -> Result<(), StoreError> {
        if let Some(agg) = aggregates
            .iter()
            .find(|a| a.source != source || a.date != date)
        {
            return Err(StoreError::Corrupt {
                table: "daily_aggregates",
                detail: format!(
                    "aggregate for {}/{} passed to replace {}/{}",
                    agg.source, agg.date, source, date
                ),
            });
        }
        let mut state = self.state.write().await;
        state
            .aggregates
            .retain(|(day, src, _), _| !(*day == date && src == source));
        for agg in aggregates {
            state
                .aggregates
                .insert((agg.date, agg.source.clone(), agg.category), agg.clone());
        }
        Ok(())
    }

    async fn daily_aggregates(
        &self,
        source: Option<&str>,
        window: DayWindow,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .aggregates
            .values()
            .filter(|a| window.contains(a.date) && source.map_or(true, |s| a.source == s))
            .cloned()
            .collect())
    }

    async fn upsert_source_status(&self, status: &SourceRunStatus) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut next = status.clone();
        if next.last_sync_at.is_none() {
            next.last_sync_at = state
                .statuses
                .get(&status.source)
                .and_then(|prev| prev.last_sync_at);
        }
        state.statuses.insert(status.source.clone(), next);
        Ok(())
    }

    async fn source_statuses(&self) -> Result<Vec<SourceRunStatus>, StoreError> {
        let state = self.state.read().await;
        Ok(state.statuses.values().cloned().collect())
    }

    async fn insert_run_log(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.run_log.iter().any(|e| e.id == entry.id) {
            return Ok(());
        }
        state.run_log.push(entry.clone());
        Ok(())
    }

    async fn complete_run_log(
        &self,
        id: Uuid,
        completion: &RunCompletion,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let Some(entry) = state
            .run_log
            .iter_mut()
            .find(|e| e.id == id && e.completed_at.is_none())
        else {
            return Ok(false);
        };
        entry.completed_at = Some(completion.completed_at);
        entry.outcome = completion.outcome;
        entry.records_synced = completion.records_synced;
        entry.error_message = completion.error_message.clone();
        Ok(true)
    }

    async fn run_logs(&self, query: &RunLogQuery) -> Result<RunLogPage, StoreError> {
        let state = self.state.read().await;
        let mut matching = state
            .run_log
            .iter()
            .filter(|e| query.source.as_deref().map_or(true, |s| e.source == s))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = matching.len() as u64;
        let entries = matching
            .into_iter()
            .skip(query.offset())
            .take(query.per_page())
            .collect();
        Ok(RunLogPage {
            entries,
            page: query.page(),
            per_page: query.per_page(),
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use secpulse_core::{aggregate_records, RunOutcome, Severity, SourceHealth};

    fn rec(source: &str, id: &str, day: u32, severity: Severity) -> CollectedRecord {
        CollectedRecord {
            id: id.into(),
            source: source.into(),
            category: Category::Alert,
            severity,
            status: "open".into(),
            title: format!("{source}-{id}"),
            description: String::new(),
            occurred_at: Utc.with_ymd_and_hms(2026, 9, day, 12, 0, 0).single().unwrap(),
            raw: serde_json::json!({"id": id}),
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_and_reports_previous_date() {
        let store = MemoryStore::new();
        assert_eq!(store.upsert_record(&rec("edr", "1", 1, Severity::Low)).await.unwrap(), None);
        let prev = store
            .upsert_record(&rec("edr", "1", 3, Severity::High))
            .await
            .unwrap();
        assert_eq!(prev, NaiveDate::from_ymd_opt(2026, 9, 1));
        assert_eq!(store.count_records(Some("edr")).await.unwrap(), 1);
        let stored = store.get_record("edr", "1").await.unwrap().unwrap();
        assert_eq!(stored.severity, Severity::High);
    }

    #[tokio::test]
    async fn replacing_aggregates_only_touches_one_source_day() {
        let store = MemoryStore::new();
        let edr = vec![rec("edr", "1", 1, Severity::Low), rec("edr", "2", 2, Severity::Low)];
        let mail = vec![rec("mail", "1", 1, Severity::High)];
        for agg in aggregate_records(edr.iter().chain(mail.iter())) {
            store
                .replace_daily_aggregates(&agg.source.clone(), agg.date, std::slice::from_ref(&agg))
                .await
                .unwrap();
        }

        let day1 = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        store.replace_daily_aggregates("edr", day1, &[]).await.unwrap();

        let window = DayWindow::new(day1, NaiveDate::from_ymd_opt(2026, 9, 10).unwrap()).unwrap();
        let remaining = store.daily_aggregates(None, window).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|a| a.source == "mail" && a.date == day1));
        assert!(!remaining.iter().any(|a| a.source == "edr" && a.date == day1));
    }

    #[tokio::test]
    async fn failed_status_keeps_last_successful_sync_time() {
        let store = MemoryStore::new();
        let synced_at = Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).single().unwrap();
        let mut status = SourceRunStatus::unknown("edr");
        status.status = SourceHealth::Healthy;
        status.last_sync_at = Some(synced_at);
        store.upsert_source_status(&status).await.unwrap();

        status.status = SourceHealth::Error;
        status.last_sync_at = None;
        status.last_error = Some("timeout".into());
        store.upsert_source_status(&status).await.unwrap();

        let rows = store.source_statuses().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, SourceHealth::Error);
        assert_eq!(rows[0].last_sync_at, Some(synced_at));
    }

    #[tokio::test]
    async fn run_log_entries_complete_once_and_page_newest_first() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();
        let mut ids = Vec::new();
        for (i, source) in ["edr", "mail", "edr"].iter().enumerate() {
            let mut entry = RunLogEntry::start(run_id, *source);
            entry.started_at = Utc.with_ymd_and_hms(2026, 9, 1, i as u32, 0, 0).single().unwrap();
            store.insert_run_log(&entry).await.unwrap();
            ids.push(entry.id);
        }

        let done = RunCompletion {
            completed_at: Utc::now(),
            outcome: RunOutcome::Success,
            records_synced: 4,
            error_message: None,
        };
        assert!(store.complete_run_log(ids[0], &done).await.unwrap());
        let again = RunCompletion {
            outcome: RunOutcome::Failed,
            ..done.clone()
        };
        assert!(!store.complete_run_log(ids[0], &again).await.unwrap());

        let page = store
            .run_logs(&RunLogQuery {
                source: Some("edr".into()),
                page: Some(1),
                per_page: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].id, ids[2]);

        let all = store.run_logs(&RunLogQuery::default()).await.unwrap();
        let first = all.entries.iter().find(|e| e.id == ids[0]).unwrap();
        assert_eq!(first.outcome, RunOutcome::Success);
        assert_eq!(first.records_synced, 4);
    }
}
