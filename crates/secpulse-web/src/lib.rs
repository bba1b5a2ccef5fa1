//! Axum JSON API over the collection pipeline.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Datelike, Utc};
use secpulse_core::{parse_days_spec, DayWindow};
use secpulse_storage::RunLogQuery;
use secpulse_sync::{maybe_build_scheduler, OrchestratorError, SyncRuntime, TrendMetric};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "secpulse-web";

const DEFAULT_SUMMARY_WINDOW: &str = "7d";
const DEFAULT_TREND_DAYS: u32 = 7;

#[derive(Clone)]
pub struct AppState {
    pub runtime: SyncRuntime,
}

impl AppState {
    pub fn new(runtime: SyncRuntime) -> Self {
        Self { runtime }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SummaryQuery {
    window: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TrendQuery {
    days: Option<u32>,
    source: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MonthlyQuery {
    month: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sync/all", post(sync_all_handler))
        .route("/sync/status", get(sync_status_handler))
        .route("/sync/logs", get(sync_logs_handler))
        .route("/sync/{source}", post(sync_one_handler))
        .route("/summary", get(summary_handler))
        .route("/trends/{metric}", get(trend_handler))
        .route("/reports/monthly", get(monthly_report_handler))
        .with_state(Arc::new(state))
}

/// Serve on `0.0.0.0:{web_port}`, running the cron scheduler alongside when enabled.
pub async fn serve(runtime: SyncRuntime) -> anyhow::Result<()> {
    let port = runtime.config.web_port;
    let scheduler = maybe_build_scheduler(&runtime.config, runtime.orchestrator.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(runtime))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(SyncRuntime::from_env().await?).await
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn sync_all_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runtime.orchestrator.collect_all().await {
        Ok(outcomes) => Json(outcomes).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn sync_one_handler(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
) -> Response {
    match state.runtime.orchestrator.collect_one(&source).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err @ OrchestratorError::UnknownSource(_)) => not_found(err.to_string()),
        Err(err) => server_error(err.into()),
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runtime.orchestrator.source_statuses().await {
        Ok(statuses) => Json(statuses).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn sync_logs_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RunLogQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match state.runtime.store.run_logs(&query).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<SummaryQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let spec = query.window.as_deref().unwrap_or(DEFAULT_SUMMARY_WINDOW);
    let days = match parse_days_spec(spec) {
        Ok(days) => days,
        Err(err) => return bad_request(err.to_string()),
    };
    match state.runtime.summaries.summary(days).await {
        Ok(served) => Json(served).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn trend_handler(
    State(state): State<Arc<AppState>>,
    Path(metric): Path<String>,
    query: Result<Query<TrendQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let metric: TrendMetric = match metric.parse() {
        Ok(metric) => metric,
        Err(err) => return bad_request(format!("{err}")),
    };
    let days = query.days.unwrap_or(DEFAULT_TREND_DAYS);
    if !(1..=366).contains(&days) {
        return bad_request(format!("days must be between 1 and 366, got {days}"));
    }
    if let Some(source) = &query.source {
        if state.runtime.orchestrator.registry().get(source).is_none() {
            return not_found(format!("unknown source {source:?}"));
        }
    }

    let today = Utc::now().date_naive();
    match state
        .runtime
        .trends()
        .trailing(metric, query.source.as_deref(), days, today)
        .await
    {
        Ok(trend) => Json(trend).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn monthly_report_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<MonthlyQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let month = match query.month.as_deref() {
        Some(raw) => DayWindow::parse_month(raw),
        None => {
            let today = Utc::now().date_naive();
            DayWindow::month(today.year(), today.month())
        }
    };
    let month = match month {
        Ok(month) => month,
        Err(err) => return bad_request(err.to_string()),
    };
    match state.runtime.summaries.monthly_report(month).await {
        Ok(served) => Json(served).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn bad_request(message: String) -> Response {
    error_body(StatusCode::BAD_REQUEST, message)
}

fn not_found(message: String) -> Response {
    error_body(StatusCode::NOT_FOUND, message)
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use secpulse_adapters::{AdapterRegistry, FixtureAdapter};
    use secpulse_storage::{MemoryCache, MemoryStore};
    use secpulse_sync::{OrchestratorOptions, SyncConfig};
    use serde_json::Value;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    fn fixture() -> NamedTempFile {
        let now = Utc::now().to_rfc3339();
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "e-1", "category": "alert", "severity": "critical", "title": "ransomware", "occurred_at": "{now}"}},
                {{"id": "e-2", "category": "alert", "severity": "critical", "title": "beacon", "occurred_at": "{now}"}},
                {{"id": "e-3", "category": "event", "severity": "low", "title": "login", "occurred_at": "{now}"}}
            ]"#
        )
        .unwrap();
        file
    }

    fn test_app(file: &NamedTempFile) -> Router {
        let registry = AdapterRegistry::new()
            .with(Arc::new(FixtureAdapter::new("edr", file.path())))
            .with(Arc::new(FixtureAdapter::new("siem", "/nonexistent/siem.json")));
        let runtime = SyncRuntime::with_parts(
            SyncConfig::default(),
            registry,
            OrchestratorOptions::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::new(16)),
        );
        app(AppState::new(runtime))
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_health() {
        let file = fixture();
        let (status, body) = call(&test_app(&file), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn sync_all_itemizes_outcomes_and_updates_status() {
        let file = fixture();
        let app = test_app(&file);

        let (status, body) = call(&app, "POST", "/sync/all").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["source"], "edr");
        assert_eq!(body[0]["status"], "success");
        assert_eq!(body[0]["records_synced"], 3);
        assert_eq!(body[1]["status"], "skipped");

        let (status, body) = call(&app, "GET", "/sync/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["status"], "healthy");
        assert_eq!(body[1]["status"], "not_configured");

        let (status, body) = call(&app, "GET", "/sync/logs?per_page=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["entries"].as_array().unwrap().len(), 1);

        let (status, body) = call(&app, "GET", "/sync/logs?page=18446744073709551615").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["entries"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_unknown_source_is_404() {
        let file = fixture();
        let (status, body) = call(&test_app(&file), "POST", "/sync/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn bad_queries_are_400() {
        let file = fixture();
        let app = test_app(&file);
        for uri in [
            "/summary?window=forever",
            "/trends/volume",
            "/trends/total?days=0",
            "/reports/monthly?month=2026-13",
            "/sync/logs?page=first",
        ] {
            let (status, body) = call(&app, "GET", uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert!(body["error"].is_string(), "{uri}");
        }
    }

    #[tokio::test]
    async fn summary_trend_and_report_read_collected_data() {
        let file = fixture();
        let app = test_app(&file);
        call(&app, "POST", "/sync/edr").await;

        let (status, body) = call(&app, "GET", "/summary?window=7d").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["freshness"], "fresh");
        assert_eq!(body["value"]["score"], 79);

        let (status, body) = call(&app, "GET", "/trends/severity:critical?days=7&source=edr").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["current"], 2.0);
        assert_eq!(body["direction"], "up");

        let (status, _) = call(&app, "GET", "/trends/total?source=ghost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "GET", "/reports/monthly").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"]["total_events"], 3);
    }
}
