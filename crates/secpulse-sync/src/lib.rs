//! Collection orchestration, read-side services, and runtime bootstrap.

pub mod config;
pub mod orchestrator;
pub mod read_through;
pub mod report;
pub mod scheduler;
pub mod summary;
pub mod trend;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use secpulse_adapters::{AdapterRegistry, HttpClientConfig, HttpFetcher, TokenBucketConfig};
use secpulse_core::SourceOutcome;
use secpulse_storage::{
    CacheLayer, DisabledCache, MemoryCache, MemoryStore, PersistenceStore, PgStore,
};
use tracing::{info, warn};

pub use config::{build_registry, ConfigError, SourceConfig, SourceKind, SourcesFile, SyncConfig};
pub use orchestrator::{
    normalize_batch, CollectFailure, CollectionOrchestrator, OrchestratorError, OrchestratorOptions,
};
pub use read_through::{Freshness, ReadError, ReadThrough, Served, StalePolicy};
pub use report::{build_monthly_report, DailyPoint, MonthlyReport};
pub use scheduler::maybe_build_scheduler;
pub use summary::{Rollup, SecuritySummary, SourceBreakdown, SummaryService};
pub use trend::{Direction, Trend, TrendEngine, TrendError, TrendMetric};

pub const CRATE_NAME: &str = "secpulse-sync";

/// Everything the CLI and web server share, wired from one [`SyncConfig`].
#[derive(Clone)]
pub struct SyncRuntime {
    pub config: Arc<SyncConfig>,
    pub store: Arc<dyn PersistenceStore>,
    pub cache: Arc<dyn CacheLayer>,
    pub orchestrator: CollectionOrchestrator,
    pub summaries: SummaryService,
}

impl SyncRuntime {
    pub async fn from_env() -> Result<Self> {
        Self::from_config(SyncConfig::from_env()).await
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store: Arc<dyn PersistenceStore> = match &config.database_url {
            Some(url) => {
                let pg = PgStore::connect(url)
                    .await
                    .context("connecting to DATABASE_URL")?;
                pg.migrate().await.context("running migrations")?;
                Arc::new(pg)
            }
            None => {
                warn!(
                    "DATABASE_URL not set; using in-memory store, nothing will survive a restart"
                );
                Arc::new(MemoryStore::new())
            }
        };

        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: std::time::Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            token_bucket: (config.http_requests_per_sec > 0).then(|| TokenBucketConfig {
                capacity: config.http_requests_per_sec,
                refill_every: std::time::Duration::from_millis(
                    (1000 / u64::from(config.http_requests_per_sec)).max(1),
                ),
            }),
            ..Default::default()
        })?);

        let sources = SourcesFile::load(&config.sources_file).await?;
        let base_dir = config
            .sources_file
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let built = build_registry(&sources, base_dir, http, |key| std::env::var(key).ok())?;
        info!(
            sources = built.registry.len(),
            file = %config.sources_file.display(),
            "source registry loaded"
        );

        let options = OrchestratorOptions {
            lookback_hours: config.lookback_hours,
            default_timeout: config.source_timeout,
            source_timeouts: built.timeouts,
        };
        let cache: Arc<dyn CacheLayer> = if config.cache_max_entries == 0 {
            info!("cache disabled; every read goes to the source of record");
            Arc::new(DisabledCache)
        } else {
            Arc::new(MemoryCache::new(config.cache_max_entries))
        };
        Ok(Self::with_parts(config, built.registry, options, store, cache))
    }

    pub fn with_parts(
        config: SyncConfig,
        registry: AdapterRegistry,
        options: OrchestratorOptions,
        store: Arc<dyn PersistenceStore>,
        cache: Arc<dyn CacheLayer>,
    ) -> Self {
        let registry = Arc::new(registry);
        let orchestrator = CollectionOrchestrator::new(registry.clone(), store.clone(), options);
        let summaries = SummaryService::new(
            registry,
            store.clone(),
            ReadThrough::new(cache.clone(), StalePolicy::default()),
            config.summary_ttl_secs,
            config.source_timeout,
        );
        Self {
            config: Arc::new(config),
            store,
            cache,
            orchestrator,
            summaries,
        }
    }

    pub fn trends(&self) -> &TrendEngine {
        self.summaries.trends()
    }
}

pub async fn run_sync_once_from_env() -> Result<Vec<SourceOutcome>> {
    let runtime = SyncRuntime::from_env().await?;
    runtime
        .orchestrator
        .collect_all()
        .await
        .context("collecting from all sources")
}
