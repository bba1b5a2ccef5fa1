//! Fan-out collection across every registered source.
//!
//! Each source runs in its own tokio task and touches only its own rows. A
//! source that fails, times out, panics, or is unconfigured yields an itemized
//! outcome; it never aborts the others.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use secpulse_adapters::{AdapterError, AdapterRegistry, SourceAdapter};
use secpulse_core::{
    aggregate_records, CollectedRecord, CollectionWindow, OutcomeStatus, RunCompletion,
    RunLogEntry, RunOutcome, SourceHealth, SourceOutcome, SourceRunStatus,
};
use secpulse_storage::{PersistenceStore, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Why one source's collection did not succeed.
#[derive(Debug, Error)]
pub enum CollectFailure {
    #[error("source is not configured")]
    NotConfigured,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("persistence failed after {committed} records: {source}")]
    Persistence {
        committed: u64,
        #[source]
        source: StoreError,
    },
    #[error("adapter timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl CollectFailure {
    fn committed(&self) -> Option<u64> {
        match self {
            CollectFailure::Persistence { committed, .. } => Some(*committed),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown source {0:?}")]
    UnknownSource(String),
    #[error("no source status could be recorded for run {0}")]
    StatusUnavailable(Uuid),
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub lookback_hours: u32,
    pub default_timeout: Duration,
    pub source_timeouts: HashMap<String, Duration>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            lookback_hours: 24,
            default_timeout: Duration::from_secs(60),
            source_timeouts: HashMap::new(),
        }
    }
}

impl OrchestratorOptions {
    pub fn timeout_for(&self, source: &str) -> Duration {
        self.source_timeouts
            .get(source)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

#[derive(Clone)]
pub struct CollectionOrchestrator {
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn PersistenceStore>,
    options: Arc<OrchestratorOptions>,
}

impl std::fmt::Debug for CollectionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionOrchestrator")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish()
    }
}

struct SpawnedSource {
    source: String,
    entry: RunLogEntry,
    started: Instant,
    handle: JoinHandle<TaskReport>,
}

struct TaskReport {
    outcome: SourceOutcome,
    status_written: bool,
}

impl CollectionOrchestrator {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn PersistenceStore>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            registry,
            store,
            options: Arc::new(options),
        }
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Collect from every registered source concurrently and wait for all of them.
    ///
    /// Outcomes are returned in registry order.
    pub async fn collect_all(&self) -> Result<Vec<SourceOutcome>, OrchestratorError> {
        let run_id = Uuid::new_v4();
        let window = CollectionWindow::lookback(self.options.lookback_hours, Utc::now());
        info!(%run_id, sources = self.registry.len(), "starting collection run");

        let spawned: Vec<SpawnedSource> = self
            .registry
            .iter()
            .map(|adapter| self.spawn_source(run_id, adapter.clone(), window))
            .collect();
        if spawned.is_empty() {
            return Ok(Vec::new());
        }

        let reports = self.join(spawned).await;
        let status_written = reports.iter().any(|r| r.status_written);
        let outcomes: Vec<SourceOutcome> = reports.into_iter().map(|r| r.outcome).collect();

        let failed = outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
            .count();
        info!(%run_id, sources = outcomes.len(), failed, "collection run finished");

        if !status_written {
            return Err(OrchestratorError::StatusUnavailable(run_id));
        }
        Ok(outcomes)
    }

    pub async fn collect_one(&self, source: &str) -> Result<SourceOutcome, OrchestratorError> {
        let adapter = self
            .registry
            .get(source)
            .ok_or_else(|| OrchestratorError::UnknownSource(source.to_string()))?;
        let run_id = Uuid::new_v4();
        let window = CollectionWindow::lookback(self.options.lookback_hours, Utc::now());

        let spawned = self.spawn_source(run_id, adapter, window);
        let mut reports = self.join(vec![spawned]).await;
        match reports.pop() {
            Some(report) if report.status_written => Ok(report.outcome),
            _ => Err(OrchestratorError::StatusUnavailable(run_id)),
        }
    }

    /// Stored status for every registered source; sources never run report `unknown`.
    pub async fn source_statuses(&self) -> Result<Vec<SourceRunStatus>, StoreError> {
        let mut stored: HashMap<String, SourceRunStatus> = self
            .store
            .source_statuses()
            .await?
            .into_iter()
            .map(|s| (s.source.clone(), s))
            .collect();
        Ok(self
            .registry
            .names()
            .into_iter()
            .map(|name| {
                stored
                    .remove(&name)
                    .unwrap_or_else(|| SourceRunStatus::unknown(name))
            })
            .collect())
    }

    fn spawn_source(
        &self,
        run_id: Uuid,
        adapter: Arc<dyn SourceAdapter>,
        window: CollectionWindow,
    ) -> SpawnedSource {
        let source = adapter.source().to_string();
        let entry = RunLogEntry::start(run_id, &source);
        let task = SourceTask {
            adapter,
            store: self.store.clone(),
            window,
            timeout: self.options.timeout_for(&source),
            entry: entry.clone(),
        };
        let span = info_span!("collect_source", %run_id, source = %source);
        SpawnedSource {
            source,
            entry,
            started: Instant::now(),
            handle: tokio::spawn(task.run().instrument(span)),
        }
    }

    async fn join(&self, spawned: Vec<SpawnedSource>) -> Vec<TaskReport> {
        let (meta, handles): (Vec<_>, Vec<_>) = spawned
            .into_iter()
            .map(|s| ((s.source, s.entry, s.started), s.handle))
            .unzip();
        let results = join_all(handles).await;

        let mut reports = Vec::with_capacity(results.len());
        for ((source, entry, started), result) in meta.into_iter().zip(results) {
            match result {
                Ok(report) => reports.push(report),
                Err(join_err) => {
                    let duration_ms = elapsed_ms(started);
                    let message = if join_err.is_panic() {
                        "collection task panicked".to_string()
                    } else {
                        format!("collection task aborted: {join_err}")
                    };
                    error!(source = %source, run_id = %entry.run_id, "{message}");
                    let outcome = SourceOutcome::failed(&source, &message, None, duration_ms);
                    let status_written = self.record_crash(&entry, &message).await;
                    reports.push(TaskReport {
                        outcome,
                        status_written,
                    });
                }
            }
        }
        reports
    }

    async fn record_crash(&self, entry: &RunLogEntry, message: &str) -> bool {
        let completion = RunCompletion {
            completed_at: Utc::now(),
            outcome: RunOutcome::Failed,
            records_synced: 0,
            error_message: Some(message.to_string()),
        };
        if let Err(err) = self.store.complete_run_log(entry.id, &completion).await {
            warn!(source = %entry.source, error = %err, "could not finalize run-log entry");
        }
        let status = SourceRunStatus {
            source: entry.source.clone(),
            status: SourceHealth::Error,
            last_sync_at: None,
            last_error: Some(message.to_string()),
            records_synced: 0,
            updated_at: Utc::now(),
        };
        match self.store.upsert_source_status(&status).await {
            Ok(()) => true,
            Err(err) => {
                error!(source = %entry.source, error = %err, "could not record source status");
                false
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Stamp the owning source and collapse repeated identities; the last occurrence wins.
pub fn normalize_batch(source: &str, batch: Vec<CollectedRecord>) -> Vec<CollectedRecord> {
    let mut seen = HashSet::new();
    let mut unique: Vec<CollectedRecord> = batch
        .into_iter()
        .rev()
        .filter_map(|mut record| {
            record.source = source.to_string();
            seen.insert(record.id.clone()).then_some(record)
        })
        .collect();
    unique.reverse();
    unique
}

struct SourceTask {
    adapter: Arc<dyn SourceAdapter>,
    store: Arc<dyn PersistenceStore>,
    window: CollectionWindow,
    timeout: Duration,
    entry: RunLogEntry,
}

impl SourceTask {
    async fn run(self) -> TaskReport {
        let started = Instant::now();
        let source = self.adapter.source().to_string();

        let logged = match self.store.insert_run_log(&self.entry).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "could not record run start; continuing without a run-log row");
                false
            }
        };

        let result = self.collect(&source).await;
        let duration_ms = elapsed_ms(started);
        let now = Utc::now();

        let (outcome, completion, status) = match result {
            Ok(records) => {
                info!(records, duration_ms, "source collected");
                (
                    SourceOutcome::success(&source, records, duration_ms),
                    RunCompletion {
                        completed_at: now,
                        outcome: RunOutcome::Success,
                        records_synced: records,
                        error_message: None,
                    },
                    SourceRunStatus {
                        source: source.clone(),
                        status: SourceHealth::Healthy,
                        last_sync_at: Some(now),
                        last_error: None,
                        records_synced: records,
                        updated_at: now,
                    },
                )
            }
            Err(CollectFailure::NotConfigured) => {
                info!("source not configured; skipped");
                (
                    SourceOutcome::skipped(&source, duration_ms),
                    RunCompletion {
                        completed_at: now,
                        outcome: RunOutcome::Skipped,
                        records_synced: 0,
                        error_message: None,
                    },
                    SourceRunStatus {
                        source: source.clone(),
                        status: SourceHealth::NotConfigured,
                        last_sync_at: None,
                        last_error: None,
                        records_synced: 0,
                        updated_at: now,
                    },
                )
            }
            Err(failure) => {
                let message = failure.to_string();
                let committed = failure.committed();
                warn!(error = %message, committed, duration_ms, "source collection failed");
                (
                    SourceOutcome::failed(&source, &message, committed, duration_ms),
                    RunCompletion {
                        completed_at: now,
                        outcome: RunOutcome::Failed,
                        records_synced: committed.unwrap_or(0),
                        error_message: Some(message.clone()),
                    },
                    SourceRunStatus {
                        source: source.clone(),
                        status: SourceHealth::Error,
                        last_sync_at: None,
                        last_error: Some(message),
                        records_synced: committed.unwrap_or(0),
                        updated_at: now,
                    },
                )
            }
        };

        if logged {
            match self.store.complete_run_log(self.entry.id, &completion).await {
                Ok(true) => {}
                Ok(false) => warn!("run-log entry was already finalized"),
                Err(err) => warn!(error = %err, "could not finalize run-log entry"),
            }
        }

        let status_written = match self.store.upsert_source_status(&status).await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "could not record source status");
                false
            }
        };

        TaskReport {
            outcome,
            status_written,
        }
    }

    async fn collect(&self, source: &str) -> Result<u64, CollectFailure> {
        if !self.adapter.is_configured() {
            return Err(CollectFailure::NotConfigured);
        }

        let fetch = self.adapter.fetch_batch(&self.window);
        let batch = match tokio::time::timeout(self.timeout, fetch).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(AdapterError::NotConfigured(_))) => return Err(CollectFailure::NotConfigured),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(CollectFailure::Timeout(self.timeout)),
        };
        let records = normalize_batch(source, batch);

        let mut dates = BTreeSet::new();
        let mut committed = 0u64;
        let mut upsert_error = None;
        for record in &records {
            match self.store.upsert_record(record).await {
                Ok(previous) => {
                    committed += 1;
                    dates.insert(record.occurred_on());
                    dates.extend(previous);
                }
                Err(err) => {
                    upsert_error = Some(err);
                    break;
                }
            }
        }

        // Committed rows are durable either way, so their days are recomputed even after a failure.
        let recomputed = self.recompute_aggregates(source, &dates).await;
        if let Some(source) = upsert_error {
            return Err(CollectFailure::Persistence { committed, source });
        }
        recomputed.map_err(|source| CollectFailure::Persistence { committed, source })?;
        Ok(committed)
    }

    async fn recompute_aggregates(
        &self,
        source: &str,
        dates: &BTreeSet<NaiveDate>,
    ) -> Result<(), StoreError> {
        if dates.is_empty() {
            return Ok(());
        }
        let days: Vec<NaiveDate> = dates.iter().copied().collect();
        let stored = self.store.records_on_dates(source, &days).await?;
        let aggregates = aggregate_records(&stored);
        for day in days {
            let rows: Vec<_> = aggregates.iter().filter(|a| a.date == day).cloned().collect();
            self.store.replace_daily_aggregates(source, day, &rows).await?;
        }
        Ok(())
    }
}
