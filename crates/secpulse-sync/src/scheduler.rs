use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::orchestrator::CollectionOrchestrator;

/// Cron jobs that run a full collection, or `None` when scheduling is disabled.
///
/// The scheduler is returned unstarted; callers decide when to `start()` it.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: CollectionOrchestrator,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in &config.sync_crons {
        let orchestrator = orchestrator.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                match orchestrator.collect_all().await {
                    Ok(outcomes) => {
                        info!(sources = outcomes.len(), "scheduled collection finished")
                    }
                    Err(err) => warn!(error = %err, "scheduled collection failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, "scheduled collection job");
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorOptions;
    use secpulse_adapters::AdapterRegistry;
    use secpulse_storage::MemoryStore;
    use std::sync::Arc;

    fn orchestrator() -> CollectionOrchestrator {
        CollectionOrchestrator::new(
            Arc::new(AdapterRegistry::new()),
            Arc::new(MemoryStore::new()),
            OrchestratorOptions::default(),
        )
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let config = SyncConfig::default();
        assert!(maybe_build_scheduler(&config, orchestrator()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_cron_is_reported() {
        let config = SyncConfig {
            scheduler_enabled: true,
            sync_crons: vec!["every tuesday".into()],
            ..SyncConfig::default()
        };
        let err = maybe_build_scheduler(&config, orchestrator()).await.err().expect("expected an error");
        assert!(err.to_string().contains("every tuesday"));
    }
}
